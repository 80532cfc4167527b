use std::sync::Arc;

use anyhow::Error;

use crate::resources::context::ResourceContext;
use crate::resources::DeviceSpec;

/// Completion hooks wired into a task when it is dispatched. A task must
/// invoke exactly one of them when it finishes.
pub struct TaskCallbacks {
    /// The task completed successfully.
    pub done: Box<dyn FnOnce() + Send>,
    /// The task failed due to device memory. Returns true when the engine
    /// took the task back for a retry; false means the failure is the
    /// owner's to report.
    pub mem_failure: Box<dyn FnOnce() -> bool + Send>,
    /// Any other failure, terminal for the task.
    pub error: Box<dyn FnOnce(Error) + Send>,
}

/// A unit of work submitted to the engine. The engine never looks inside:
/// it stages the task's resources via `prepare`, hands it to a pool worker
/// via `run`, and may `cancel` it while still queued.
pub trait OperationTask: Send + Sync {
    /// Stage the resources this task needs to run on `spec`. Called by the
    /// scheduling policy before dispatch and retried on later iterations
    /// when staging fell short. Must be cheap when already staged.
    fn prepare(&self, spec: DeviceSpec) -> bool;

    /// Execute the task. Exactly one callback must fire, possibly from
    /// another thread when the task is asynchronous.
    fn run(&self, cbs: TaskCallbacks);

    /// Called instead of `run` when the task is dropped from the queue.
    fn cancel(&self);

    /// Asynchronous tasks release their pool worker before completing and
    /// are excluded from the no-paging-progress accounting.
    fn is_async(&self) -> bool;

    /// The staged allocation backing this task, if `prepare` succeeded.
    fn resource_context(&self) -> Option<Arc<ResourceContext>>;
}
