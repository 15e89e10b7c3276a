//! fleetd 执行引擎的核心类型
//!
//! 包含错误分类、数据模型、配置、主机过滤以及对外部协作方（设备驱动、
//! 库存来源、模板渲染）的抽象接口。

pub mod config;
pub mod errors;
pub mod filter;
pub mod models;
pub mod traits;

pub use errors::*;
pub use filter::HostFilter;
