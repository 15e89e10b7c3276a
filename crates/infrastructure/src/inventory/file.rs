use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fleetd_core::models::Inventory;
use fleetd_core::traits::InventoryProvider;
use fleetd_core::{EngineError, EngineResult};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 基于文件的库存（TOML 或 JSON，按扩展名判断）
pub struct FileInventory {
    path: PathBuf,
    changes: broadcast::Sender<()>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            path: path.into(),
            changes,
            watcher: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 监听文件变化，变化时通知订阅者
    pub fn watch(&self) -> EngineResult<()> {
        let changes = self.changes.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    debug!("库存文件变化: {:?}", event.paths);
                    let _ = changes.send(());
                }
                Ok(_) => {}
                Err(e) => warn!("库存文件监听错误: {}", e),
            }
        })
        .map_err(|e| EngineError::Inventory(format!("创建文件监听失败: {e}")))?;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                EngineError::Inventory(format!("监听库存文件 {} 失败: {e}", self.path.display()))
            })?;

        let mut slot = self
            .watcher
            .lock()
            .map_err(|_| EngineError::Internal("库存监听器锁已损坏".to_string()))?;
        *slot = Some(watcher);
        info!("开始监听库存文件: {}", self.path.display());
        Ok(())
    }

    fn parse(&self, content: &str) -> EngineResult<Inventory> {
        let is_json = self.path.extension().and_then(|e| e.to_str()) == Some("json");
        if is_json {
            serde_json::from_str(content)
                .map_err(|e| EngineError::Inventory(format!("JSON库存解析失败: {e}")))
        } else {
            toml::from_str(content)
                .map_err(|e| EngineError::Inventory(format!("TOML库存解析失败: {e}")))
        }
    }
}

#[async_trait]
impl InventoryProvider for FileInventory {
    async fn load(&self) -> EngineResult<Inventory> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::Inventory(format!("读取库存文件 {} 失败: {e}", self.path.display()))
        })?;
        let inventory = self.parse(&content)?;
        debug!("从 {} 加载 {} 台设备", self.path.display(), inventory.len());
        Ok(inventory)
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const INVENTORY_TOML: &str = r#"
[hosts.r1]
hostname = "10.0.0.1"
groups = ["core"]

[hosts.r2]
hostname = "10.0.0.2"

[groups.core]
platform = "eos"

[defaults]
username = "admin"
password = "secret"

[defaults.credentials.backup]
username = "backup"
password = "backup"
"#;

    #[tokio::test]
    async fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(INVENTORY_TOML.as_bytes()).unwrap();

        let provider = FileInventory::new(file.path());
        let inventory = provider.load().await.unwrap();
        assert_eq!(inventory.len(), 2);
        assert!(inventory.credential("backup").is_some());

        let resolved = inventory.resolve();
        assert_eq!(resolved["r1"].platform.as_deref(), Some("eos"));
        assert_eq!(resolved["r2"].username.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(br#"{"hosts": {"r1": {"hostname": "10.0.0.1"}}}"#)
            .unwrap();

        let inventory = FileInventory::new(file.path()).load().await.unwrap();
        assert_eq!(inventory.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = FileInventory::new("/nonexistent/inventory.toml")
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Inventory(_)));
    }
}
