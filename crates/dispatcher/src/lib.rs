//! fleetd Dispatcher：Controller、Worker选择策略与Watchdog

pub mod controller;
pub mod strategies;
pub mod watchdog;

pub use controller::{Controller, ControllerDeps};
pub use strategies::{
    FirstIdleStrategy, LeastLoadedStrategy, WorkerCandidate, WorkerSelectionStrategy,
};
pub use watchdog::{RestartReason, Watchdog, WatchdogAction, WatchdogStats};
