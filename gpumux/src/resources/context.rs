use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::monitor::{MonitorProxy, ResourceMonitor, Ticket};
use super::{DeviceSpec, ResourceTag, ResourceType, Resources, CPU0};
use crate::session::SessionItem;

/// Binds a ticket to a session so that staged and committed quantities also
/// show up in the session's own books. Staging is released at the latest
/// when the context is dropped.
pub struct ResourceContext {
    session: Arc<SessionItem>,
    monitor: Arc<ResourceMonitor>,
    spec: DeviceSpec,
    ticket: Ticket,
    has_staging: AtomicBool,
}

impl ResourceContext {
    pub fn new(session: Arc<SessionItem>, monitor: Arc<ResourceMonitor>) -> Self {
        Self {
            session,
            monitor,
            spec: CPU0,
            ticket: Ticket::INVALID,
            has_staging: AtomicBool::new(false),
        }
    }

    /// Reserve `res` on `spec` atomically. On shortfall nothing is reserved
    /// and the per-tag deficits land in `missing`.
    pub fn initialize_staging(
        &mut self,
        spec: DeviceSpec,
        res: &Resources,
        missing: &mut Resources,
    ) -> bool {
        debug_assert!(!self.has_staging.load(Ordering::SeqCst));
        self.spec = spec;
        if let Some(ticket) = self.monitor.pre_allocate(res, missing) {
            self.ticket = ticket;
            self.has_staging.store(true, Ordering::SeqCst);
        }
        self.has_staging.load(Ordering::SeqCst)
    }

    /// True while the context holds a live staging reservation.
    pub fn is_good(&self) -> bool {
        self.ticket.is_valid() && self.has_staging.load(Ordering::SeqCst)
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    pub(crate) fn session(&self) -> &Arc<SessionItem> {
        &self.session
    }

    /// Return remaining staging to the monitor. When the ticket has no
    /// usage left afterwards, it is also dropped from the session.
    pub fn release_staging(&self) {
        if !self.has_staging.swap(false, Ordering::SeqCst) {
            return;
        }
        self.monitor.free_staging(self.ticket);
        if !self.monitor.has_usage(self.ticket) {
            self.session.remove_memory_allocation_ticket(self.ticket);
        }
    }

    /// Begin committing everything staged for `ty` on this context's device.
    pub fn alloc(&self, ty: ResourceType) -> OperationScope<'_> {
        let mut proxy = self.monitor.lock();
        let tag = ResourceTag::new(ty, self.spec);
        let staged = proxy.query_staging(self.ticket);
        let mut res = Resources::new();
        let mut valid = false;
        if let Some(num) = staged.get(&tag) {
            res.insert(tag, *num);
            valid = proxy.allocate(self.ticket, &res);
        }
        OperationScope {
            context: self,
            proxy,
            res,
            valid,
            committed: false,
        }
    }

    /// Begin committing exactly `num` units of `ty`.
    pub fn alloc_exact(&self, ty: ResourceType, num: usize) -> OperationScope<'_> {
        let mut proxy = self.monitor.lock();
        let tag = ResourceTag::new(ty, self.spec);
        let mut res = Resources::new();
        res.insert(tag, num);
        let valid = proxy.allocate(self.ticket, &res);
        OperationScope {
            context: self,
            proxy,
            res,
            valid,
            committed: false,
        }
    }

    /// Decommit `num` units of `ty` and take them off the session's books.
    pub fn dealloc(&self, ty: ResourceType, num: usize) {
        let tag = ResourceTag::new(ty, self.spec);
        let mut res = Resources::new();
        res.insert(tag, num);
        self.monitor.free(self.ticket, &res);
        self.session.sub_resource_usage(tag, num);
    }
}

impl Drop for ResourceContext {
    fn drop(&mut self) {
        self.release_staging();
    }
}

impl fmt::Display for ResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.ticket.is_valid() {
            return write!(f, "AllocationTicket(Invalid)");
        }
        write!(f, "AllocationTicket({}, device={})", self.ticket, self.spec)
    }
}

/// A guarded commit of staged quantities. Holds the monitor proxy so the
/// allocation appears atomic; an uncommitted scope rolls back on drop.
pub struct OperationScope<'a> {
    context: &'a ResourceContext,
    proxy: MonitorProxy<'a>,
    res: Resources,
    valid: bool,
    committed: bool,
}

impl OperationScope<'_> {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Credit the committed quantities to the session and record the ticket.
    pub fn commit(mut self) {
        if !self.valid {
            return;
        }
        for (tag, num) in &self.res {
            self.context.session.add_resource_usage(*tag, *num);
            self.context.session.notify_memory_allocation(self.context.ticket);
        }
        self.committed = true;
    }

    /// Return the reserved quantities to the monitor without crediting the
    /// session.
    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        if self.valid && !self.committed {
            self.proxy.free(self.context.ticket, &self.res);
            self.valid = false;
        }
    }
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        self.undo();
    }
}
