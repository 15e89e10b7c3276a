//! fleetd Worker：连接管理、重试控制、作业函数以及Worker执行体

pub mod backends;
pub mod connection;
pub mod functions;
pub mod queue;
pub mod retry;
pub mod worker;

pub use backends::{BackendRegistry, MockBackend, MockResponse, ShellBackend};
pub use connection::{CloseStatus, ConnectionInfo, ConnectionLease, ConnectionManager, OpenRequest};
pub use functions::{
    AdminOp, DeviceTask, FunctionHandler, FunctionRegistry, TaskContext, TaskOutput,
};
pub use queue::{QueueLoad, QueuedJob, WorkerQueue};
pub use retry::{Backoff, RetryController, RetryOutcome, RetryPolicy};
pub use worker::{spawn_worker, RefreshSummary, WorkerDeps, WorkerHandle, WorkerState};
