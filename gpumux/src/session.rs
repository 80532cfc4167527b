use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::resources::monitor::Ticket;
use crate::resources::{ResourceTag, Resources};
use crate::resources::context::ResourceContext;
use crate::task::OperationTask;

/// Hooks a session owner registers so the engine can ask it to relocate
/// memory under pressure, or tell it that it has been evicted.
pub struct PagingCallbacks {
    /// Asked to page out the given ticket into the pre-allocated target-side
    /// context; returns the number of bytes released on the source device.
    pub volunteer: Box<dyn FnMut(Ticket, ResourceContext) -> usize + Send>,
    /// Invoked once when the engine force-evicts the session.
    pub force_evicted: Box<dyn FnMut() + Send>,
}

/// An enqueued operation. Holds only a weak reference to its session so a
/// deleted session frees naturally; the first failed upgrade drops the item.
pub struct OperationItem {
    pub sess: Weak<SessionItem>,
    pub op: Box<dyn OperationTask>,
}

pub type OpItem = Arc<OperationItem>;

struct SessionInner {
    queue: VecDeque<OpItem>,
    bg_queue: VecDeque<OpItem>,
    paging_cb: Option<PagingCallbacks>,
    cleanup_cb: Option<Box<dyn FnOnce() + Send>>,
}

/// Per-session state shared between the engine, the scheduler loop and all
/// in-flight operation items.
///
/// The `inner` mutex guards the two queues, the paging callbacks and the
/// executed-op counter; tickets and per-tag usage have their own locks so
/// accounting paths never contend with queue traffic.
pub struct SessionItem {
    handle: OnceLock<String>,
    inner: Mutex<SessionInner>,
    tickets: Mutex<HashSet<Ticket>>,
    usage: Mutex<Resources>,
    protect_oom: AtomicBool,
    force_evicted: AtomicBool,
    last_scheduled: AtomicUsize,
    executed: AtomicU64,
}

impl SessionItem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handle: OnceLock::new(),
            inner: Mutex::new(SessionInner {
                queue: VecDeque::new(),
                bg_queue: VecDeque::new(),
                paging_cb: None,
                cleanup_cb: None,
            }),
            tickets: Mutex::new(HashSet::new()),
            usage: Mutex::new(Resources::new()),
            protect_oom: AtomicBool::new(false),
            force_evicted: AtomicBool::new(false),
            last_scheduled: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
        })
    }

    pub(crate) fn set_handle(&self, handle: &str) {
        let _ = self.handle.set(handle.to_string());
    }

    /// Session handle; empty until the offer was accepted.
    pub fn handle(&self) -> &str {
        self.handle.get().map_or("", String::as_str)
    }

    pub(crate) fn push_op(&self, op: OpItem) {
        self.lock_inner().queue.push_back(op);
    }

    /// One scheduling-iteration prologue: splice the front queue into the
    /// scheduler-owned back queue, cancel everything when force-evicted, and
    /// reset the per-iteration counters. Returns the pending count.
    pub(crate) fn prepare_iteration(&self, protect_oom: bool) -> usize {
        let mut canceled = Vec::new();
        let remaining = {
            let mut inner = self.lock_inner();
            let mut moved = std::mem::take(&mut inner.queue);
            inner.bg_queue.append(&mut moved);
            if self.is_force_evicted() && !inner.bg_queue.is_empty() {
                crate::trace!(
                    "canceling pending tasks in force evicted session {}",
                    self.handle()
                );
                canceled.extend(inner.bg_queue.drain(..));
            }
            inner.bg_queue.len()
        };
        for op in &canceled {
            op.op.cancel();
        }
        self.protect_oom.store(protect_oom, Ordering::SeqCst);
        self.last_scheduled.store(0, Ordering::SeqCst);
        remaining
    }

    pub fn bg_len(&self) -> usize {
        self.lock_inner().bg_queue.len()
    }

    pub fn pop_bg(&self) -> Option<OpItem> {
        self.lock_inner().bg_queue.pop_front()
    }

    pub fn push_bg_front(&self, op: OpItem) {
        self.lock_inner().bg_queue.push_front(op);
    }

    pub(crate) fn set_paging_callbacks(&self, cb: PagingCallbacks) {
        self.lock_inner().paging_cb = Some(cb);
    }

    /// Run `f` with the paging callbacks while holding the session lock.
    /// The lock blocks new submissions and callback teardown for the
    /// duration, which paging relies on.
    pub(crate) fn with_paging_lock<R>(
        &self,
        f: impl FnOnce(Option<&mut PagingCallbacks>) -> R,
    ) -> R {
        let mut inner = self.lock_inner();
        f(inner.paging_cb.as_mut())
    }

    pub(crate) fn prepare_delete(&self, cb: Box<dyn FnOnce() + Send>) {
        self.lock_inner().cleanup_cb = Some(cb);
    }

    pub(crate) fn inc_executed(&self) {
        self.executed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn total_executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Current counted usage for one tag.
    pub fn resource_usage(&self, tag: ResourceTag) -> usize {
        self.lock_usage().get(&tag).copied().unwrap_or(0)
    }

    pub(crate) fn add_resource_usage(&self, tag: ResourceTag, num: usize) {
        *self.lock_usage().entry(tag).or_insert(0) += num;
    }

    pub(crate) fn sub_resource_usage(&self, tag: ResourceTag, num: usize) {
        let mut usage = self.lock_usage();
        if let Some(have) = usage.get_mut(&tag) {
            *have = have.saturating_sub(num);
            if *have == 0 {
                usage.remove(&tag);
            }
        }
    }

    /// Record that the ticket now owns memory allocated on behalf of this
    /// session.
    pub(crate) fn notify_memory_allocation(&self, ticket: Ticket) {
        self.lock_tickets().insert(ticket);
    }

    pub(crate) fn remove_memory_allocation_ticket(&self, ticket: Ticket) {
        self.lock_tickets().remove(&ticket);
    }

    pub fn tickets_snapshot(&self) -> HashSet<Ticket> {
        self.lock_tickets().clone()
    }

    pub fn protect_oom(&self) -> bool {
        self.protect_oom.load(Ordering::SeqCst)
    }

    pub(crate) fn set_protect_oom(&self, protect: bool) {
        self.protect_oom.store(protect, Ordering::SeqCst);
    }

    pub fn is_force_evicted(&self) -> bool {
        self.force_evicted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_force_evicted(&self) {
        self.force_evicted.store(true, Ordering::SeqCst);
    }

    pub fn last_scheduled(&self) -> usize {
        self.last_scheduled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_last_scheduled(&self, count: usize) {
        self.last_scheduled.store(count, Ordering::SeqCst);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session state mutex poisoned")
    }

    fn lock_tickets(&self) -> std::sync::MutexGuard<'_, HashSet<Ticket>> {
        self.tickets.lock().expect("session tickets mutex poisoned")
    }

    fn lock_usage(&self) -> std::sync::MutexGuard<'_, Resources> {
        self.usage.lock().expect("session usage mutex poisoned")
    }
}

impl Drop for SessionItem {
    fn drop(&mut self) {
        let cleanup = self
            .inner
            .get_mut()
            .ok()
            .and_then(|inner| inner.cleanup_cb.take());
        if let Some(cb) = cleanup {
            cb();
        }
    }
}
