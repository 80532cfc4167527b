pub mod logging;

mod context;
mod engine;
mod pool;
mod resources;
mod scheduler;
mod session;
mod task;

pub use context::ExecutionContext;
pub use engine::{EngineHandle, ExecutionEngine, SchedulerParams};
pub use pool::WorkerPool;
pub use resources::context::{OperationScope, ResourceContext};
pub use resources::monitor::{MonitorProxy, MonitorSnapshot, ResourceMonitor, Ticket};
pub use resources::tracker::{OfferId, SessionResourceTracker};
pub use resources::{
    contains, format_resources, merge, remove_zeros, subtract, DeviceSpec, DeviceType,
    ResourceTag, ResourceType, Resources, CPU0, GPU0,
};
pub use scheduler::{register_policy, PolicyFactory, SchedulingPolicy, SessionChangeSet};
pub use session::{OpItem, OperationItem, PagingCallbacks, SessionItem};
pub use task::{OperationTask, TaskCallbacks};
