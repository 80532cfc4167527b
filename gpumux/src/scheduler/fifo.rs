use std::collections::HashSet;
use std::sync::Arc;

use super::{SchedulingPolicy, SessionChangeSet};
use crate::engine::EngineHandle;
use crate::resources::{DeviceSpec, GPU0};
use crate::session::SessionItem;

pub(crate) fn create(engine: EngineHandle) -> Box<dyn SchedulingPolicy> {
    Box::new(FifoPolicy {
        engine,
        starved: HashSet::new(),
    })
}

/// Default policy: sessions are candidates in insertion order, operations
/// are dispatched head-of-line within each session. A session whose head
/// cannot stage its resources is left alone for the iteration; a full pool
/// ends the iteration.
struct FifoPolicy {
    engine: EngineHandle,
    starved: HashSet<DeviceSpec>,
}

impl SchedulingPolicy for FifoPolicy {
    fn notify_pre_scheduling_iteration(
        &mut self,
        sessions: &[Arc<SessionItem>],
        _changeset: &SessionChangeSet,
        candidates: &mut Vec<Arc<SessionItem>>,
    ) {
        self.starved.clear();
        candidates.clear();
        candidates.extend(
            sessions
                .iter()
                .filter(|sess| sess.bg_len() > 0)
                .cloned(),
        );
    }

    fn maybe_schedule_from(&mut self, sess: &Arc<SessionItem>) -> (usize, bool) {
        let device = GPU0;
        let mut scheduled = 0;
        while let Some(op_item) = sess.pop_bg() {
            let staged = op_item
                .op
                .resource_context()
                .is_some_and(|rctx| rctx.is_good());
            if !staged && !op_item.op.prepare(device) {
                // Head-of-line blocked on memory; keep FIFO order within
                // the session and let other candidates proceed.
                self.starved.insert(device);
                sess.push_bg_front(op_item);
                return (scheduled, true);
            }

            match self.engine.submit_task(op_item) {
                None => scheduled += 1,
                Some(op_item) => {
                    let pool_full = op_item
                        .op
                        .resource_context()
                        .is_some_and(|rctx| rctx.is_good());
                    sess.push_bg_front(op_item);
                    if pool_full {
                        return (scheduled, false);
                    }
                    self.starved.insert(device);
                    return (scheduled, true);
                }
            }
        }
        (scheduled, true)
    }

    fn insufficient_memory(&mut self, spec: DeviceSpec) -> bool {
        self.starved.contains(&spec)
    }

    fn debug_string(&self, sess: &Arc<SessionItem>) -> String {
        format!("fifo: pending {}", sess.bg_len())
    }
}
