//! 配置管理
//!
//! `AppConfig` 是代理的完整配置，由 `config` crate 从TOML文件和环境变量加载；
//! `EngineConfig` 是其中交给执行引擎的子集，在构造 Controller 时显式传入。

pub mod app_config;
pub mod engine;


pub use app_config::{AppConfig, InventoryConfig, ObservabilityConfig};
pub use engine::{
    ArtifactConfig, ConnectionConfig, EngineConfig, ExecutionConfig, MemoryAction,
    MemoryProbeKind, WatchdogConfig,
};
