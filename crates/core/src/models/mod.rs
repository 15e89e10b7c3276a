//! # 数据模型
//!
//! 执行引擎的核心数据结构：设备库存、作业请求、作业结果、Worker统计和生命周期事件。
//! 所有模型都实现了序列化和反序列化，便于写入结果队列、文件和日志。

pub mod device;
pub mod event;
pub mod job;
pub mod result;
pub mod stats;

pub use device::*;
pub use event::*;
pub use job::*;
pub use result::*;
pub use stats::*;
