mod notify;
mod paging;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::context::ExecutionContext;
use crate::pool::WorkerPool;
use crate::resources::context::ResourceContext;
use crate::resources::monitor::ResourceMonitor;
use crate::resources::tracker::SessionResourceTracker;
use crate::resources::{format_resources, DeviceSpec, Resources, CPU0, GPU0};
use crate::scheduler::{self, SchedulingPolicy, SessionChangeSet};
use crate::session::{OpItem, SessionItem};
use crate::task::TaskCallbacks;

use notify::Notifier;

/// Engine construction knobs.
pub struct SchedulerParams {
    /// Name of the scheduling policy looked up in the registry.
    pub policy: String,
    /// Worker pool capacity.
    pub workers: usize,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            policy: "fifo".to_string(),
            workers: thread::available_parallelism().map_or(4, |n| n.get()),
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) monitor: Arc<ResourceMonitor>,
    pub(crate) tracker: SessionResourceTracker,
    pool: WorkerPool,
    new_sessions: Mutex<Vec<Arc<SessionItem>>>,
    deleted_sessions: Mutex<Vec<Arc<SessionItem>>>,
    should_exit: AtomicBool,
    note_has_work: Notifier,
    running_tasks: AtomicUsize,
    no_paging_running_tasks: AtomicUsize,
}

/// The execution engine: admits sessions, runs the scheduler loop on its
/// own thread and dispatches operations to the worker pool.
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
    sched_thread: Option<thread::JoinHandle<()>>,
}

/// Cheap clonable handle handed to scheduling policies.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) inner: Arc<EngineInner>,
}

impl EngineHandle {
    /// Dispatch one operation to the worker pool. Returns the item back
    /// when it could not be scheduled this iteration.
    pub fn submit_task(&self, op_item: OpItem) -> Option<OpItem> {
        submit_task(&self.inner, op_item)
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.inner.monitor
    }
}

impl ExecutionEngine {
    /// Initialize resource limits, create the worker pool and start the
    /// scheduler thread.
    pub fn start(params: SchedulerParams, limits: Resources) -> Result<Self> {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.initialize_limits(limits.clone());

        let inner = Arc::new(EngineInner {
            monitor,
            tracker: SessionResourceTracker::new(limits),
            pool: WorkerPool::new(params.workers)?,
            new_sessions: Mutex::new(Vec::new()),
            deleted_sessions: Mutex::new(Vec::new()),
            should_exit: AtomicBool::new(false),
            note_has_work: Notifier::new(),
            running_tasks: AtomicUsize::new(0),
            no_paging_running_tasks: AtomicUsize::new(0),
        });

        let policy = scheduler::create_policy(
            &params.policy,
            EngineHandle {
                inner: inner.clone(),
            },
        )?;
        crate::trace!("using scheduling policy: {}", params.policy);

        let thread_inner = inner.clone();
        let sched_thread = thread::Builder::new()
            .name("gpumux-sched".to_string())
            .spawn(move || schedule_loop(thread_inner, policy))
            .map_err(|err| anyhow!("failed to spawn scheduler thread: {}", err))?;

        Ok(Self {
            inner,
            sched_thread: Some(sched_thread),
        })
    }

    /// Ask admission control for a new session. None means the predicted
    /// usage does not fit next to the already admitted sessions.
    pub fn create_session_offer(&self, predicted: Resources) -> Option<ExecutionContext> {
        match self.inner.tracker.admit(&predicted) {
            Some(offer) => Some(ExecutionContext::new(self.inner.clone(), offer)),
            None => {
                crate::warning!(
                    "rejecting session due to unsafe resource usage; predicted [{}], current {}",
                    format_resources(&predicted),
                    self.inner.tracker.debug_string()
                );
                None
            }
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn running_tasks(&self) -> usize {
        self.inner.running_tasks.load(Ordering::SeqCst)
    }

    /// Stop the scheduler thread and drop any pending session changes.
    pub fn shutdown(&mut self) {
        let Some(sched_thread) = self.sched_thread.take() else {
            return;
        };
        self.inner.should_exit.store(true, Ordering::SeqCst);
        self.inner.note_has_work.notify();
        if sched_thread.join().is_err() {
            crate::error!("scheduler thread panicked");
        }

        // Pending changes are dropped only after the loop has exited.
        self.inner.lock_new().clear();
        self.inner.lock_deleted().clear();
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineInner {
    pub(crate) fn insert_session(&self, item: Arc<SessionItem>) {
        self.lock_new().push(item);
        self.note_has_work.notify();
    }

    pub(crate) fn delete_session(&self, item: Arc<SessionItem>) {
        self.lock_deleted().push(item);
        self.note_has_work.notify();
    }

    /// Append an operation to its session's front queue. Items whose
    /// session is already gone are discarded silently.
    pub(crate) fn push_to_session_queue(&self, op_item: OpItem) {
        let Some(sess) = op_item.sess.upgrade() else {
            return;
        };
        sess.push_op(op_item);
        self.note_has_work.notify();
    }

    pub(crate) fn make_resource_context(
        &self,
        sess: &Arc<SessionItem>,
        spec: DeviceSpec,
        res: &Resources,
        missing: &mut Resources,
    ) -> ResourceContext {
        let mut rctx = ResourceContext::new(sess.clone(), self.monitor.clone());
        if !rctx.initialize_staging(spec, res, missing) {
            crate::trace!(
                "staging [{}] on {} failed for session {}; missing [{}]",
                format_resources(res),
                spec,
                sess.handle(),
                format_resources(missing)
            );
        }
        rctx
    }

    fn task_running(&self, op_item: &OpItem) {
        self.running_tasks.fetch_add(1, Ordering::SeqCst);
        if !op_item.op.is_async() {
            self.no_paging_running_tasks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn task_stopped(&self, op_item: &OpItem, failed: bool) {
        if let Some(rctx) = op_item.op.resource_context() {
            rctx.release_staging();
        }
        if !failed {
            if let Some(sess) = op_item.sess.upgrade() {
                sess.inc_executed();
            }
        }
        self.running_tasks.fetch_sub(1, Ordering::SeqCst);
        if !op_item.op.is_async() {
            self.no_paging_running_tasks.fetch_sub(1, Ordering::SeqCst);
        }
        self.note_has_work.notify();
    }

    fn lock_new(&self) -> std::sync::MutexGuard<'_, Vec<Arc<SessionItem>>> {
        self.new_sessions.lock().expect("new sessions mutex poisoned")
    }

    fn lock_deleted(&self) -> std::sync::MutexGuard<'_, Vec<Arc<SessionItem>>> {
        self.deleted_sessions
            .lock()
            .expect("deleted sessions mutex poisoned")
    }
}

/// Dispatch one operation to the worker pool. Returns None when accepted or
/// when the session vanished; otherwise hands the item back so the caller
/// can keep it queued.
pub(crate) fn submit_task(engine: &Arc<EngineInner>, op_item: OpItem) -> Option<OpItem> {
    let Some(sess) = op_item.sess.upgrade() else {
        return None;
    };

    let staged = op_item
        .op
        .resource_context()
        .is_some_and(|rctx| rctx.is_good());
    if !staged {
        crate::error!(
            "submitted task with uninitialized resource context in session {}",
            sess.handle()
        );
        return Some(op_item);
    }
    drop(sess);

    // The scheduler thread waits on this path, so the operation must never
    // run inline; a full pool simply reports the item as not scheduled.
    let run_item = op_item.clone();
    let run_engine = engine.clone();
    let job = move || {
        let Some(sess) = run_item.sess.upgrade() else {
            return;
        };

        let cbs = TaskCallbacks {
            done: {
                let engine = run_engine.clone();
                let item = run_item.clone();
                Box::new(move || engine.task_stopped(&item, false))
            },
            mem_failure: {
                let engine = run_engine.clone();
                let item = run_item.clone();
                Box::new(move || {
                    let Some(sess) = item.sess.upgrade() else {
                        crate::trace!("expired session during task memory failure");
                        return false;
                    };
                    if !sess.protect_oom() {
                        crate::trace!(
                            "passing OOM failed task back to client of session {}",
                            sess.handle()
                        );
                        return false;
                    }
                    engine.task_stopped(&item, true);
                    crate::trace!("requeueing OOM failed task in session {}", sess.handle());
                    engine.push_to_session_queue(item.clone());
                    true
                })
            },
            error: {
                let engine = run_engine.clone();
                let item = run_item.clone();
                Box::new(move |err| {
                    crate::error!("task failed: {:#}", err);
                    engine.task_stopped(&item, true);
                })
            },
        };

        crate::trace!("running task in session {}", sess.handle());
        run_engine.task_running(&run_item);
        run_item.op.run(cbs);
    };

    match engine.pool.try_run(job) {
        None => None,
        Some(_job) => Some(op_item),
    }
}

/// Backoff state for iterations that make no progress: sleep 10ms after
/// 20ms without work, doubling until progress resets it.
struct IterationPacer {
    last_progress: Instant,
    sleep: Duration,
}

impl IterationPacer {
    const INITIAL_SLEEP: Duration = Duration::from_millis(10);
    const BORED_AFTER: Duration = Duration::from_millis(20);

    fn new() -> Self {
        Self {
            last_progress: Instant::now(),
            sleep: Self::INITIAL_SLEEP,
        }
    }

    fn maybe_wait(&mut self, scheduled: usize) -> bool {
        let now = Instant::now();
        if scheduled > 0 {
            self.last_progress = now;
            self.sleep = Self::INITIAL_SLEEP;
        }

        let idle = now.duration_since(self.last_progress);
        if idle <= Self::BORED_AFTER {
            return false;
        }

        crate::trace!(
            "no progress for {}ms, sleeping {}ms",
            idle.as_millis(),
            self.sleep.as_millis()
        );
        thread::sleep(self.sleep);
        self.sleep *= 2;
        true
    }
}

fn schedule_loop(inner: Arc<EngineInner>, mut policy: Box<dyn SchedulingPolicy>) {
    let mut sessions: Vec<Arc<SessionItem>> = Vec::new();
    let mut candidates: Vec<Arc<SessionItem>> = Vec::new();
    let mut pacer = IterationPacer::new();
    let mut iter_count: u64 = 0;

    while !inner.should_exit.load(Ordering::SeqCst) {
        iter_count += 1;

        // First swap out any pending deletions, then drop those sessions
        // from the live list. They stay in the changeset until the policy
        // has seen them.
        let deleted = std::mem::take(&mut *inner.lock_deleted());
        let mut added = std::mem::take(&mut *inner.lock_new());
        if !deleted.is_empty() {
            sessions.retain(|sess| {
                let is_deleted = deleted.iter().any(|del| Arc::ptr_eq(del, sess));
                if is_deleted {
                    crate::trace!("deleting session {}", sess.handle());
                }
                !is_deleted
            });
            // A session deleted before its first iteration never becomes
            // live.
            added.retain(|sess| !deleted.iter().any(|del| Arc::ptr_eq(del, sess)));
        }

        // Append new sessions to the tail and remember the added range.
        let added_session_range = sessions.len()..sessions.len() + added.len();
        sessions.extend(added);

        let changeset = SessionChangeSet {
            num_added_sessions: added_session_range.len(),
            added_session_range,
            deleted_sessions: deleted,
        };

        // Move every session's front queue into the scheduler-owned back
        // queue and reset per-iteration state.
        let protect_oom = sessions.len() > 1;
        let mut total_remaining = 0;
        for sess in &sessions {
            total_remaining += sess.prepare_iteration(protect_oom);
        }

        candidates.clear();
        policy.notify_pre_scheduling_iteration(&sessions, &changeset, &mut candidates);
        drop(changeset);

        let mut remaining = 0;
        let mut scheduled = 0;
        for sess in &candidates {
            let (count, should_continue) = policy.maybe_schedule_from(sess);
            sess.set_last_scheduled(count);
            remaining += sess.bg_len();
            scheduled += count;
            if !should_continue {
                break;
            }
        }

        crate::perf!(
            "sched iter {}: running {} no-paging-running {}",
            iter_count,
            inner.running_tasks.load(Ordering::SeqCst),
            inner.no_paging_running_tasks.load(Ordering::SeqCst)
        );
        for sess in &sessions {
            crate::perf!(
                "sched iter {} session {}: pending {} scheduled {} {}",
                iter_count,
                sess.handle(),
                sess.bg_len(),
                sess.last_scheduled(),
                policy.debug_string(sess)
            );
        }

        let no_progress = remaining > 0
            && scheduled == 0
            && inner.no_paging_running_tasks.load(Ordering::SeqCst) == 0;
        let mut did_paging = false;
        for dev in [GPU0] {
            if no_progress && policy.insufficient_memory(dev) {
                if sessions.len() > 1 {
                    did_paging = paging::do_paging(&inner, &sessions, dev, CPU0);
                } else if sessions.len() == 1 {
                    let sess = &sessions[0];
                    crate::error!("OOM on device {} for single session {}", dev, sess.handle());
                    let usage = inner.monitor.query_usages(&sess.tickets_snapshot());
                    crate::error!("this session usage: [{}]", format_resources(&usage));
                    crate::error!("{}", inner.monitor.debug_string());
                }
            }
        }
        if did_paging {
            // Freed memory; retry another iteration immediately.
            continue;
        }

        pacer.maybe_wait(scheduled);

        if total_remaining == 0 && !inner.should_exit.load(Ordering::SeqCst) {
            crate::trace!("scheduler idle, waiting for work");
            inner.note_has_work.wait();
        }
    }

    sessions.clear();
}
