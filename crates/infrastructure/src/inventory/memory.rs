use async_trait::async_trait;
use fleetd_core::models::Inventory;
use fleetd_core::traits::InventoryProvider;
use fleetd_core::EngineResult;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

/// 内存中的库存
///
/// 嵌入式使用和测试使用。`replace` 替换整个库存并通知订阅者。
pub struct StaticInventory {
    inventory: RwLock<Inventory>,
    changes: broadcast::Sender<()>,
}

impl StaticInventory {
    pub fn new(inventory: Inventory) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            inventory: RwLock::new(inventory),
            changes,
        }
    }

    pub async fn replace(&self, inventory: Inventory) {
        let hosts = inventory.len();
        *self.inventory.write().await = inventory;
        info!("库存已替换，共 {} 台设备", hosts);
        let _ = self.changes.send(());
    }
}

#[async_trait]
impl InventoryProvider for StaticInventory {
    async fn load(&self) -> EngineResult<Inventory> {
        Ok(self.inventory.read().await.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_core::models::Device;

    #[tokio::test]
    async fn test_replace_notifies() {
        let provider = StaticInventory::new(Inventory::from_devices([Device::new("r1")]));
        let mut changes = provider.subscribe();
        assert_eq!(provider.load().await.unwrap().len(), 1);

        provider
            .replace(Inventory::from_devices([Device::new("r1"), Device::new("r2")]))
            .await;
        changes.recv().await.unwrap();
        assert_eq!(provider.load().await.unwrap().len(), 2);
    }
}
