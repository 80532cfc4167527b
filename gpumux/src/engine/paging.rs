use std::sync::Arc;
use std::time::Instant;

use super::EngineInner;
use crate::resources::{format_resources, DeviceSpec, ResourceTag, Resources};
use crate::session::SessionItem;

enum VolunteerOutcome {
    NoCallback,
    NothingReleased,
    Released(usize),
    TargetExhausted,
}

/// Resolve an OOM on `spec` by asking sessions to page memory out to
/// `target`, force-evicting one session when nobody volunteers. Returns
/// true when any memory was reclaimed or a session was evicted.
pub(crate) fn do_paging(
    inner: &Arc<EngineInner>,
    sessions: &[Arc<SessionItem>],
    spec: DeviceSpec,
    target: DeviceSpec,
) -> bool {
    let start = Instant::now();
    let mut released = 0;
    let mut force_evicted = String::new();
    let ok = page_out(inner, sessions, spec, target, &mut released, &mut force_evicted);
    crate::perf!(
        "paging: duration {}us released {} forceevict '{}'",
        start.elapsed().as_micros(),
        released,
        force_evicted
    );
    ok
}

fn page_out(
    inner: &Arc<EngineInner>,
    sessions: &[Arc<SessionItem>],
    spec: DeviceSpec,
    target: DeviceSpec,
    released: &mut usize,
    force_evicted: &mut String,
) -> bool {
    let src_tag = ResourceTag::memory(spec);
    let dst_tag = ResourceTag::memory(target);

    // Candidate sessions by memory usage on the source device, largest
    // first. The largest consumer is preserved; paging starts from the next.
    let mut candidates = sessions
        .iter()
        .map(|sess| (sess.resource_usage(src_tag), sess.clone()))
        .collect::<Vec<_>>();
    candidates.sort_by(|lhs, rhs| rhs.0.cmp(&lhs.0));

    if candidates.len() <= 1 {
        crate::error!("out of memory for one session");
        return false;
    }

    for (usage, sess) in &candidates {
        crate::trace!("paging candidate session {} usage {}", sess.handle(), usage);
    }

    for (_, sess) in candidates.iter().skip(1) {
        let tickets = sess.tickets_snapshot();
        if tickets.is_empty() {
            continue;
        }
        let victims = inner.monitor.sort_victim(&tickets, spec);

        // Hold the session lock while paging it: this blocks new
        // submissions and keeps the callbacks from being torn down.
        // Nothing can finish right now, so no new task can deadlock on it.
        let outcome = sess.with_paging_lock(|cb| {
            let Some(cb) = cb else {
                return VolunteerOutcome::NoCallback;
            };
            crate::trace!("visiting session {} for paging", sess.handle());

            for (usage, victim) in &victims {
                let mut res = Resources::new();
                res.insert(dst_tag, *usage);
                let mut missing = Resources::new();
                let rctx = inner.make_resource_context(sess, target, &res, &mut missing);
                if !rctx.is_good() {
                    crate::error!(
                        "not enough memory on {} for paging; required {} missing [{}]",
                        target,
                        usage,
                        format_resources(&missing)
                    );
                    return VolunteerOutcome::TargetExhausted;
                }
                crate::trace!("pre-allocated {} for session {}", rctx, sess.handle());

                crate::trace!("requesting page-out of ticket {} with usage {}", victim, usage);
                let freed = (cb.volunteer)(*victim, rctx);
                if freed > 0 {
                    crate::trace!("released {} bytes via paging", freed);
                    return VolunteerOutcome::Released(freed);
                }
                crate::trace!("ticket {} released nothing", victim);
            }
            VolunteerOutcome::NothingReleased
        });

        match outcome {
            VolunteerOutcome::Released(freed) => {
                *released += freed;
                return true;
            }
            VolunteerOutcome::TargetExhausted => return false,
            VolunteerOutcome::NoCallback | VolunteerOutcome::NothingReleased => {}
        }
    }

    crate::error!("all paging requests failed, dumping session usage");
    for (usage, sess) in &candidates {
        crate::error!("session {} usage: {}", sess.handle(), usage);
    }
    crate::error!("{}", inner.monitor.debug_string());

    // Last resort: kill one session. At most one per call.
    for (usage, sess) in &candidates {
        let evicted = sess.with_paging_lock(|cb| {
            let Some(cb) = cb else {
                return false;
            };
            sess.set_protect_oom(false);
            sess.set_force_evicted();
            crate::trace!("force evicting session {} with usage {}", sess.handle(), usage);
            (cb.force_evicted)();
            true
        });
        if evicted {
            *force_evicted = sess.handle().to_string();
            return true;
        }
    }

    crate::error!("nothing to force evict");
    false
}
