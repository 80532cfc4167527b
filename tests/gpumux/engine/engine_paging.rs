use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gpumux::{PagingCallbacks, ResourceType, Ticket, CPU0, GPU0};

use crate::common::{
    accept_session, commit_memory, start_engine, wait_until, TaskProbe, TestTask, WAIT_TIMEOUT,
};

#[test]
fn paging_asks_smaller_session_to_volunteer() {
    let engine = start_engine(1_000, 10_000, 2);
    let ctx_a = accept_session(&engine, "sess-a", 600);
    let ctx_b = accept_session(&engine, "sess-b", 300);

    // A is the largest consumer and must be preserved.
    let rctx_a = commit_memory(&ctx_a, GPU0, 600);
    let rctx_b = commit_memory(&ctx_b, GPU0, 300);

    let a_volunteered = Arc::new(AtomicUsize::new(0));
    ctx_a.register_paging_callbacks(PagingCallbacks {
        volunteer: {
            let calls = a_volunteered.clone();
            Box::new(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                0
            })
        },
        force_evicted: Box::new(|| {}),
    });

    let b_volunteered = Arc::new(Mutex::new(Vec::<Ticket>::new()));
    ctx_b.register_paging_callbacks(PagingCallbacks {
        volunteer: {
            let calls = b_volunteered.clone();
            let rctx = rctx_b.clone();
            Box::new(move |ticket, cpu_rctx| {
                calls.lock().unwrap().push(ticket);
                assert!(cpu_rctx.is_good());
                assert_eq!(cpu_rctx.spec(), CPU0);
                // Page our whole allocation out of GPU memory.
                rctx.dealloc(ResourceType::Memory, 300);
                300
            })
        },
        force_evicted: Box::new(|| panic!("volunteering session must not be evicted")),
    });

    // Needs 200 while only 100 are free; unblocks once B pages out.
    let probe = TaskProbe::default();
    ctx_b.enqueue_operation(
        TestTask::new(&ctx_b)
            .needs_memory(GPU0, 200)
            .with_probe(&probe)
            .boxed(),
    );

    assert!(
        wait_until(WAIT_TIMEOUT, || probe.runs() == 1),
        "blocked operation never ran"
    );
    assert_eq!(a_volunteered.load(Ordering::SeqCst), 0);
    let volunteered = b_volunteered.lock().unwrap().clone();
    assert_eq!(volunteered, vec![rctx_b.ticket()]);

    // The largest consumer kept its allocation untouched.
    let tickets: std::collections::HashSet<Ticket> = std::iter::once(rctx_a.ticket()).collect();
    let usage = engine.handle().monitor().query_usages(&tickets);
    assert_eq!(
        usage.get(&gpumux::ResourceTag::memory(GPU0)),
        Some(&600)
    );
}

#[test]
fn force_evicts_when_nobody_volunteers() {
    let engine = start_engine(1_000, 10_000, 2);
    let ctx_a = accept_session(&engine, "sess-a", 600);
    let ctx_b = accept_session(&engine, "sess-b", 300);

    // A holds the most memory but registers no paging callbacks.
    let _rctx_a = commit_memory(&ctx_a, GPU0, 600);
    let _rctx_b = commit_memory(&ctx_b, GPU0, 300);

    let volunteer_calls = Arc::new(AtomicUsize::new(0));
    let evictions = Arc::new(AtomicUsize::new(0));
    ctx_b.register_paging_callbacks(PagingCallbacks {
        volunteer: {
            let calls = volunteer_calls.clone();
            Box::new(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                0
            })
        },
        force_evicted: {
            let evictions = evictions.clone();
            Box::new(move || {
                evictions.fetch_add(1, Ordering::SeqCst);
            })
        },
    });

    let probe = TaskProbe::default();
    for _ in 0..2 {
        ctx_b.enqueue_operation(
            TestTask::new(&ctx_b)
                .needs_memory(GPU0, 200)
                .with_probe(&probe)
                .boxed(),
        );
    }

    assert!(
        wait_until(WAIT_TIMEOUT, || evictions.load(Ordering::SeqCst) == 1),
        "session was never force evicted"
    );
    assert!(volunteer_calls.load(Ordering::SeqCst) >= 1);

    // The next iteration cancels everything the evicted session had queued.
    assert!(
        wait_until(WAIT_TIMEOUT, || probe.cancels() == 2),
        "pending operations were not canceled, got {}",
        probe.cancels()
    );
    assert_eq!(probe.runs(), 0);

    // Eviction happens at most once.
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(evictions.load(Ordering::SeqCst), 1);
}
