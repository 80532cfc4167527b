use std::sync::{Arc, Mutex};

use crate::engine::EngineInner;
use crate::resources::context::ResourceContext;
use crate::resources::tracker::OfferId;
use crate::resources::{DeviceSpec, Resources};
use crate::session::{OperationItem, PagingCallbacks, SessionItem};
use crate::task::OperationTask;

/// Client-facing handle to one admitted session. Clones share the same
/// session; the admission reservation is freed when the last clone drops.
#[derive(Clone)]
pub struct ExecutionContext {
    data: Arc<ContextData>,
}

struct ContextData {
    engine: Arc<EngineInner>,
    // Taken out on delete; a None item means the session is gone and
    // further submissions are discarded.
    item: Mutex<Option<Arc<SessionItem>>>,
    offer: OfferId,
}

impl ExecutionContext {
    pub(crate) fn new(engine: Arc<EngineInner>, offer: OfferId) -> Self {
        Self {
            data: Arc::new(ContextData {
                engine,
                item: Mutex::new(Some(SessionItem::new())),
                offer,
            }),
        }
    }

    /// Bind the session handle and make the session visible to the
    /// scheduler loop.
    pub fn accept_offer(&self, handle: &str) {
        let Some(item) = self.data.session_item() else {
            return;
        };
        self.data.engine.tracker.accept_admission(self.data.offer, handle);
        item.set_handle(handle);
        self.data.engine.insert_session(item);
    }

    /// The resource reservation this session was admitted with.
    pub fn offered_session_resource(&self) -> Option<Resources> {
        self.data.engine.tracker.usage(self.data.offer)
    }

    /// Queue one operation on the session. Operations submitted after
    /// `delete_session` are discarded silently.
    pub fn enqueue_operation(&self, task: Box<dyn OperationTask>) {
        let Some(item) = self.data.session_item() else {
            crate::trace!("discarding operation submitted after session delete");
            return;
        };
        crate::trace!("task queued in session {}", item.handle());
        let op_item = Arc::new(OperationItem {
            sess: Arc::downgrade(&item),
            op: task,
        });
        self.data.engine.push_to_session_queue(op_item);
    }

    pub fn register_paging_callbacks(&self, cb: PagingCallbacks) {
        if let Some(item) = self.data.session_item() {
            item.set_paging_callbacks(cb);
        }
    }

    /// Tear the session down. `done` fires once the engine has dropped its
    /// last reference to the session.
    pub fn delete_session(&self, done: impl FnOnce() + Send + 'static) {
        let taken = self
            .data
            .item
            .lock()
            .expect("execution context mutex poisoned")
            .take();
        let Some(item) = taken else {
            return;
        };
        item.prepare_delete(Box::new(done));
        self.data.engine.delete_session(item);
    }

    /// Stage `res` on `spec` for this session. None when the session was
    /// already deleted.
    pub fn make_resource_context(
        &self,
        spec: DeviceSpec,
        res: &Resources,
        missing: &mut Resources,
    ) -> Option<ResourceContext> {
        let item = self.data.session_item()?;
        Some(self.data.engine.make_resource_context(&item, spec, res, missing))
    }
}

impl ContextData {
    fn session_item(&self) -> Option<Arc<SessionItem>> {
        self.item
            .lock()
            .expect("execution context mutex poisoned")
            .clone()
    }
}

impl Drop for ContextData {
    fn drop(&mut self) {
        if let Ok(mut item) = self.item.lock() {
            if let Some(item) = item.take() {
                self.engine.delete_session(item);
            }
        }
        self.engine.tracker.free(self.offer);
    }
}
