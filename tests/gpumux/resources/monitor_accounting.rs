use std::collections::HashSet;

use gpumux::{ResourceMonitor, ResourceTag, Resources, Ticket, CPU0, GPU0};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const GPU_MEM: ResourceTag = ResourceTag {
    ty: gpumux::ResourceType::Memory,
    device: GPU0,
};
const CPU_MEM: ResourceTag = ResourceTag {
    ty: gpumux::ResourceType::Memory,
    device: CPU0,
};

fn monitor(gpu: usize, cpu: usize) -> ResourceMonitor {
    let mut limits = Resources::new();
    limits.insert(GPU_MEM, gpu);
    limits.insert(CPU_MEM, cpu);
    let monitor = ResourceMonitor::new();
    monitor.initialize_limits(limits);
    monitor
}

fn mem(tag: ResourceTag, bytes: usize) -> Resources {
    let mut res = Resources::new();
    res.insert(tag, bytes);
    res
}

fn assert_conserved(monitor: &ResourceMonitor) {
    let snap = monitor.snapshot();
    for (tag, total) in &snap.total {
        let avail = snap.avail.get(tag).copied().unwrap_or(0);
        let staged = snap.staged.get(tag).copied().unwrap_or(0);
        let committed = snap.committed.get(tag).copied().unwrap_or(0);
        assert_eq!(
            avail + staged + committed,
            *total,
            "conservation broken for {tag}: avail {avail} staged {staged} committed {committed}"
        );
    }
}

#[test]
fn pre_allocate_reports_shortfall() {
    let monitor = monitor(1_000, 500);
    let mut missing = Resources::new();

    let ticket = monitor.pre_allocate(&mem(GPU_MEM, 1_500), &mut missing);
    assert!(ticket.is_none());
    assert_eq!(missing.get(&GPU_MEM), Some(&500));

    // Nothing was staged by the failed attempt.
    let snap = monitor.snapshot();
    assert_eq!(snap.avail.get(&GPU_MEM), Some(&1_000));
    assert_conserved(&monitor);
}

#[test]
fn tickets_are_unique_and_nonzero() {
    let monitor = monitor(10_000, 0);
    let mut missing = Resources::new();
    let mut seen = HashSet::new();
    for _ in 0..100 {
        let ticket = monitor
            .pre_allocate(&mem(GPU_MEM, 10), &mut missing)
            .expect("staging failed");
        assert!(ticket.is_valid());
        assert!(seen.insert(ticket), "ticket {ticket} reused");
    }
}

#[test]
fn allocate_commits_staging() {
    let monitor = monitor(1_000, 0);
    let mut missing = Resources::new();
    let ticket = monitor
        .pre_allocate(&mem(GPU_MEM, 100), &mut missing)
        .expect("staging failed");

    assert!(monitor.allocate(ticket, &mem(GPU_MEM, 60)));
    assert_eq!(monitor.query_staging(ticket).get(&GPU_MEM), Some(&40));
    assert_conserved(&monitor);

    // Committing more than what is staged must fail without effect.
    assert!(!monitor.allocate(ticket, &mem(GPU_MEM, 50)));
    assert_eq!(monitor.query_staging(ticket).get(&GPU_MEM), Some(&40));
    assert_conserved(&monitor);
}

#[test]
fn free_rejects_overcommit() {
    let monitor = monitor(1_000, 0);
    let mut missing = Resources::new();
    let ticket = monitor
        .pre_allocate(&mem(GPU_MEM, 100), &mut missing)
        .expect("staging failed");
    assert!(monitor.allocate(ticket, &mem(GPU_MEM, 100)));

    assert!(!monitor.free(ticket, &mem(GPU_MEM, 150)));
    assert_conserved(&monitor);
    assert!(monitor.free(ticket, &mem(GPU_MEM, 100)));
    assert!(!monitor.has_usage(ticket));
    assert_eq!(monitor.snapshot().avail.get(&GPU_MEM), Some(&1_000));
}

#[test]
fn sort_victim_orders_by_usage() {
    let monitor = monitor(1_000, 0);
    let mut missing = Resources::new();
    let mut tickets = HashSet::new();
    for bytes in [50, 200, 100] {
        let ticket = monitor
            .pre_allocate(&mem(GPU_MEM, bytes), &mut missing)
            .expect("staging failed");
        assert!(monitor.allocate(ticket, &mem(GPU_MEM, bytes)));
        tickets.insert(ticket);
    }

    let victims = monitor.sort_victim(&tickets, GPU0);
    let usages = victims.iter().map(|(usage, _)| *usage).collect::<Vec<_>>();
    assert_eq!(usages, vec![200, 100, 50]);
}

#[test]
fn usage_lifecycle_closes_ticket() {
    let monitor = monitor(1_000, 0);
    let mut missing = Resources::new();
    let ticket = monitor
        .pre_allocate(&mem(GPU_MEM, 100), &mut missing)
        .expect("staging failed");
    assert!(monitor.has_usage(ticket));

    assert!(monitor.allocate(ticket, &mem(GPU_MEM, 100)));
    monitor.free_staging(ticket);
    assert!(monitor.has_usage(ticket), "committed usage must keep the ticket open");

    assert!(monitor.free(ticket, &mem(GPU_MEM, 100)));
    assert!(!monitor.has_usage(ticket));
    assert_conserved(&monitor);
}

struct ModelSlot {
    ticket: Ticket,
    tag: ResourceTag,
    staged: usize,
    committed: usize,
}

#[test]
fn conservation_under_random_churn() {
    let monitor = monitor(10_000, 5_000);
    let mut rng = StdRng::seed_from_u64(0x9d2c_5681);
    let mut missing = Resources::new();
    let mut slots: Vec<ModelSlot> = Vec::new();

    for round in 0..500 {
        match rng.gen_range(0..4) {
            0 => {
                let tag = if rng.gen_bool(0.5) { GPU_MEM } else { CPU_MEM };
                let bytes = rng.gen_range(1..400);
                if let Some(ticket) = monitor.pre_allocate(&mem(tag, bytes), &mut missing) {
                    slots.push(ModelSlot {
                        ticket,
                        tag,
                        staged: bytes,
                        committed: 0,
                    });
                }
            }
            1 => {
                if let Some(slot) = pick(&mut rng, &mut slots) {
                    if slot.staged > 0 {
                        let bytes = rng.gen_range(1..=slot.staged);
                        assert!(monitor.allocate(slot.ticket, &mem(slot.tag, bytes)));
                        slot.staged -= bytes;
                        slot.committed += bytes;
                    }
                }
            }
            2 => {
                if let Some(slot) = pick(&mut rng, &mut slots) {
                    if slot.committed > 0 {
                        let bytes = rng.gen_range(1..=slot.committed);
                        assert!(monitor.free(slot.ticket, &mem(slot.tag, bytes)));
                        slot.committed -= bytes;
                    }
                }
            }
            _ => {
                if let Some(slot) = pick(&mut rng, &mut slots) {
                    monitor.free_staging(slot.ticket);
                    slot.staged = 0;
                }
            }
        }

        slots.retain(|slot| slot.staged > 0 || slot.committed > 0);
        if round % 10 == 0 {
            assert_conserved(&monitor);
        }
    }

    for slot in &slots {
        monitor.free_staging(slot.ticket);
        if slot.committed > 0 {
            assert!(monitor.free(slot.ticket, &mem(slot.tag, slot.committed)));
        }
        assert!(!monitor.has_usage(slot.ticket));
    }
    let snap = monitor.snapshot();
    assert_eq!(snap.avail, snap.total);
}

fn pick<'a>(rng: &mut StdRng, slots: &'a mut [ModelSlot]) -> Option<&'a mut ModelSlot> {
    if slots.is_empty() {
        return None;
    }
    let idx = rng.gen_range(0..slots.len());
    slots.get_mut(idx)
}
