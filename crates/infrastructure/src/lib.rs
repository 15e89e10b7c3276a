//! fleetd 基础设施：Worker内存缓存、版本化文件存储、事件总线与结果队列、
//! 库存来源以及内存探测。

pub mod artifacts;
pub mod cache;
pub mod events;
pub mod inventory;
pub mod memory;

pub use artifacts::{Artifact, ArtifactIndex, ArtifactSelector, ArtifactStore};
pub use cache::{CacheScope, CacheStore};
pub use events::{EventBus, ResultsQueue};
pub use inventory::{FileInventory, StaticInventory};
pub use memory::{
    estimate_footprint_mbyte, memory_probe_for, FixedMemoryProbe, MemoryProbe,
    ProcessMemoryProbe, ReportedMemoryProbe,
};
