//! 库存来源实现

mod file;
mod memory;

pub use file::FileInventory;
pub use memory::StaticInventory;
