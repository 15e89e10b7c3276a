use std::process::Stdio;

use async_trait::async_trait;
use fleetd_core::models::{ConnectionParams, Device};
use fleetd_core::traits::{operations, ConnectionBackend, DeviceSession};
use fleetd_core::DriverError;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

/// 本地Shell后端
///
/// 连接不做任何网络操作，`cli` 命令通过 `sh -c` 在本机执行，
/// 设备信息以环境变量 `FLEETD_HOST`、`FLEETD_HOSTNAME` 传入。
#[derive(Debug, Default)]
pub struct ShellBackend;

impl ShellBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionBackend for ShellBackend {
    fn name(&self) -> &str {
        "shell"
    }

    fn supports_redispatch(&self) -> bool {
        false
    }

    async fn connect(
        &self,
        device: &Device,
        params: &ConnectionParams,
    ) -> Result<Box<dyn DeviceSession>, DriverError> {
        Ok(Box::new(ShellSession {
            device: device.name.clone(),
            hostname: params.hostname.clone().unwrap_or_else(|| device.name.clone()),
            closed: false,
        }))
    }
}

struct ShellSession {
    device: String,
    hostname: String,
    closed: bool,
}

impl ShellSession {
    async fn run(&self, command: &str) -> Result<Value, DriverError> {
        debug!("执行Shell命令: device={}, command={}", self.device, command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("FLEETD_HOST", &self.device)
            .env("FLEETD_HOSTNAME", &self.hostname)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DriverError::Fatal(format!("启动Shell命令失败: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if output.status.success() {
            Ok(Value::String(stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            Err(DriverError::Transient(format!(
                "命令退出码 {:?}: {}",
                output.status.code(),
                if stderr.is_empty() { stdout } else { stderr }
            )))
        }
    }
}

#[async_trait]
impl DeviceSession for ShellSession {
    async fn execute(&mut self, operation: &str, params: &Value) -> Result<Value, DriverError> {
        if self.closed {
            return Err(DriverError::Transient("会话已关闭".to_string()));
        }
        match operation {
            operations::CLI => {
                let command = params
                    .get("command")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DriverError::Fatal("缺少command参数".to_string()))?;
                self.run(command).await
            }
            other => Err(DriverError::Fatal(format!("shell后端不支持操作: {other}"))),
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.closed = true;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed
    }
}
