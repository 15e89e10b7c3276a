use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::models::Inventory;
use crate::EngineResult;

/// 库存来源
///
/// Worker启动和刷新时调用 `load` 获取完整快照；`subscribe` 返回的通道在
/// 库存变化时收到通知，Controller据此触发全局刷新。
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn load(&self) -> EngineResult<Inventory>;

    fn subscribe(&self) -> broadcast::Receiver<()>;
}
