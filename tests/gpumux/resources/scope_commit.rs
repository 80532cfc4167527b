use std::sync::Arc;

use gpumux::{
    ResourceContext, ResourceMonitor, ResourceTag, ResourceType, Resources, SessionItem, GPU0,
};

fn setup(limit: usize) -> (Arc<ResourceMonitor>, Arc<SessionItem>) {
    let mut limits = Resources::new();
    limits.insert(ResourceTag::memory(GPU0), limit);
    let monitor = Arc::new(ResourceMonitor::new());
    monitor.initialize_limits(limits);
    (monitor, SessionItem::new())
}

fn staged_context(
    monitor: &Arc<ResourceMonitor>,
    sess: &Arc<SessionItem>,
    bytes: usize,
) -> ResourceContext {
    let mut res = Resources::new();
    res.insert(ResourceTag::memory(GPU0), bytes);
    let mut missing = Resources::new();
    let mut rctx = ResourceContext::new(sess.clone(), monitor.clone());
    assert!(rctx.initialize_staging(GPU0, &res, &mut missing));
    rctx
}

#[test]
fn commit_credits_session() {
    let (monitor, sess) = setup(1_000);
    let rctx = staged_context(&monitor, &sess, 100);
    let ticket = rctx.ticket();

    let scope = rctx.alloc(ResourceType::Memory);
    assert!(scope.is_valid());
    scope.commit();

    assert_eq!(sess.resource_usage(ResourceTag::memory(GPU0)), 100);
    assert!(sess.tickets_snapshot().contains(&ticket));
    assert!(monitor.has_usage(ticket));
    assert!(monitor.query_staging(ticket).is_empty());
}

#[test]
fn uncommitted_scope_rolls_back_on_drop() {
    let (monitor, sess) = setup(1_000);
    let rctx = staged_context(&monitor, &sess, 100);

    {
        let scope = rctx.alloc(ResourceType::Memory);
        assert!(scope.is_valid());
        // Dropped without commit.
    }

    assert_eq!(sess.resource_usage(ResourceTag::memory(GPU0)), 0);
    assert!(sess.tickets_snapshot().is_empty());
    // The reserved quantity went back to the free pool, not to staging.
    let snap = monitor.snapshot();
    assert_eq!(snap.avail.get(&ResourceTag::memory(GPU0)), Some(&1_000));
}

#[test]
fn alloc_exact_respects_staging() {
    let (monitor, sess) = setup(1_000);
    let rctx = staged_context(&monitor, &sess, 100);

    let scope = rctx.alloc_exact(ResourceType::Memory, 150);
    assert!(!scope.is_valid());
    drop(scope);

    let scope = rctx.alloc_exact(ResourceType::Memory, 60);
    assert!(scope.is_valid());
    scope.commit();
    assert_eq!(sess.resource_usage(ResourceTag::memory(GPU0)), 60);
    assert_eq!(
        monitor.query_staging(rctx.ticket()).get(&ResourceTag::memory(GPU0)),
        Some(&40)
    );
}

#[test]
fn release_staging_closes_ticket() {
    let (monitor, sess) = setup(1_000);
    let ticket = {
        let rctx = staged_context(&monitor, &sess, 100);
        assert!(rctx.is_good());
        rctx.ticket()
        // Context dropped with staging still held.
    };

    assert!(!monitor.has_usage(ticket));
    assert!(sess.tickets_snapshot().is_empty());
    let snap = monitor.snapshot();
    assert_eq!(snap.avail, snap.total);
}

#[test]
fn dealloc_returns_committed_and_updates_session() {
    let (monitor, sess) = setup(1_000);
    let rctx = staged_context(&monitor, &sess, 300);
    let scope = rctx.alloc(ResourceType::Memory);
    assert!(scope.is_valid());
    scope.commit();
    assert_eq!(sess.resource_usage(ResourceTag::memory(GPU0)), 300);

    rctx.dealloc(ResourceType::Memory, 300);
    assert_eq!(sess.resource_usage(ResourceTag::memory(GPU0)), 0);
    let snap = monitor.snapshot();
    assert_eq!(snap.avail.get(&ResourceTag::memory(GPU0)), Some(&1_000));
}
