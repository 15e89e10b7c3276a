//! 设备驱动接口
//!
//! 引擎不关心具体协议（SSH、NETCONF、gNMI 等），只通过 `ConnectionBackend`
//! 建立会话，再通过 `DeviceSession::execute` 下发操作。驱动返回的
//! `DriverError::Transient` 会触发任务重试，`Fatal` 则使设备立即失败。

use async_trait::async_trait;
use serde_json::Value;

use crate::models::{ConnectionParams, Device};
use crate::DriverError;

/// 会话内可执行的操作名
pub mod operations {
    /// 发送单条命令，参数 `{"command": "..."}`
    pub const CLI: &str = "cli";
    /// 下发配置文本，参数 `{"config": "..."}`
    pub const CONFIG: &str = "cfg";
}

/// 已建立的设备会话
#[async_trait]
pub trait DeviceSession: Send {
    async fn execute(&mut self, operation: &str, params: &Value) -> Result<Value, DriverError>;

    async fn close(&mut self) -> Result<(), DriverError>;

    fn is_alive(&self) -> bool {
        true
    }
}

/// 连接后端
#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// 是否支持通过via路径重定向
    fn supports_redispatch(&self) -> bool {
        true
    }

    async fn connect(
        &self,
        device: &Device,
        params: &ConnectionParams,
    ) -> Result<Box<dyn DeviceSession>, DriverError>;
}
