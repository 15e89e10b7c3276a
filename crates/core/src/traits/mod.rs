//! 外部协作方接口
//!
//! 执行引擎只依赖这里的抽象：设备驱动、库存来源和模板渲染。

pub mod driver;
pub mod inventory;
pub mod renderer;

pub use driver::*;
pub use inventory::*;
pub use renderer::*;
