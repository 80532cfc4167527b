mod fifo;

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;

use crate::engine::EngineHandle;
use crate::resources::DeviceSpec;
use crate::session::SessionItem;

/// Session membership changes of one scheduling iteration, presented to the
/// policy exactly once before candidate selection.
pub struct SessionChangeSet {
    pub num_added_sessions: usize,
    /// Index range of the freshly appended sessions within the live list.
    pub added_session_range: Range<usize>,
    /// Sessions removed this iteration; dropped right after the policy has
    /// seen them.
    pub deleted_sessions: Vec<Arc<SessionItem>>,
}

/// A pluggable scheduling policy driven by the engine's scheduler loop.
pub trait SchedulingPolicy: Send {
    /// Observe the live sessions and membership changes, and fill
    /// `candidates` with the sessions to try this iteration, in order.
    fn notify_pre_scheduling_iteration(
        &mut self,
        sessions: &[Arc<SessionItem>],
        changeset: &SessionChangeSet,
        candidates: &mut Vec<Arc<SessionItem>>,
    );

    /// Try to dispatch operations from one candidate's back queue. Returns
    /// the number scheduled and whether the loop should go on to the next
    /// candidate.
    fn maybe_schedule_from(&mut self, sess: &Arc<SessionItem>) -> (usize, bool);

    /// True when the last iteration was blocked on memory of `spec`.
    fn insufficient_memory(&mut self, spec: DeviceSpec) -> bool;

    /// One-line per-session diagnostic for the perf log.
    fn debug_string(&self, sess: &Arc<SessionItem>) -> String {
        let _ = sess;
        String::new()
    }
}

/// Constructor registered under a policy name.
pub type PolicyFactory = fn(EngineHandle) -> Box<dyn SchedulingPolicy>;

static REGISTRY: Lazy<Mutex<HashMap<String, PolicyFactory>>> = Lazy::new(|| {
    let mut policies: HashMap<String, PolicyFactory> = HashMap::new();
    policies.insert("fifo".to_string(), fifo::create);
    Mutex::new(policies)
});

/// Make a policy available to `SchedulerParams::policy` lookup by name.
pub fn register_policy(name: &str, factory: PolicyFactory) {
    REGISTRY
        .lock()
        .expect("policy registry mutex poisoned")
        .insert(name.to_string(), factory);
}

pub(crate) fn create_policy(name: &str, engine: EngineHandle) -> Result<Box<dyn SchedulingPolicy>> {
    let factory = REGISTRY
        .lock()
        .expect("policy registry mutex poisoned")
        .get(name)
        .copied()
        .ok_or_else(|| anyhow!("unknown scheduling policy '{}'", name))?;
    Ok(factory(engine))
}
