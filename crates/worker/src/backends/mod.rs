//! 连接后端注册表

mod mock;
mod shell;

use std::collections::HashMap;
use std::sync::Arc;

use fleetd_core::traits::ConnectionBackend;
use tracing::info;

pub use mock::{MockBackend, MockConnect, MockExecution, MockResponse};
pub use shell::ShellBackend;

/// 按名称查找连接后端
///
/// 部署时确定的封闭集合，Worker重启时与新的Worker共享。
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn ConnectionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置后端：`shell`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellBackend::new()));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn ConnectionBackend>) {
        let name = backend.name().to_string();
        info!("注册连接后端: {}", name);
        self.backends.insert(name, backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ConnectionBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}
