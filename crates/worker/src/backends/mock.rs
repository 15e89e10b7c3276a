use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleetd_core::models::{ConnectionParams, Device};
use fleetd_core::traits::{operations, ConnectionBackend, DeviceSession};
use fleetd_core::DriverError;
use serde_json::Value;

/// 脚本化的命令响应
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    Output(Value),
    Transient(String),
    Fatal(String),
}

/// 一次连接记录
#[derive(Debug, Clone, PartialEq)]
pub struct MockConnect {
    pub device: String,
    pub params: ConnectionParams,
    pub succeeded: bool,
}

/// 一次执行记录
#[derive(Debug, Clone, PartialEq)]
pub struct MockExecution {
    pub device: String,
    pub operation: String,
    pub params: Value,
}

#[derive(Default)]
struct MockState {
    required_passwords: HashMap<String, String>,
    connect_failures: HashMap<String, u32>,
    fatal_connects: HashMap<String, String>,
    execute_failures: HashMap<String, u32>,
    responses: HashMap<String, MockResponse>,
    connect_delay: Duration,
    execute_delay: Duration,
    connects: Vec<MockConnect>,
    closes: Vec<String>,
    executions: Vec<MockExecution>,
}

/// 测试用连接后端
///
/// 可按设备设定必需的密码、前N次连接或执行的可恢复失败、不可恢复失败、
/// 延迟以及按命令的响应，并记录所有连接、关闭和执行调用。
pub struct MockBackend {
    name: String,
    redispatch: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            redispatch: true,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_redispatch(mut self, supported: bool) -> Self {
        self.redispatch = supported;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 只有使用该密码才能连接设备，否则返回认证失败
    pub fn require_password(&self, device: &str, password: &str) -> &Self {
        self.state()
            .required_passwords
            .insert(device.to_string(), password.to_string());
        self
    }

    /// 设备的前 `times` 次连接返回可恢复错误
    pub fn fail_connects(&self, device: &str, times: u32) -> &Self {
        self.state().connect_failures.insert(device.to_string(), times);
        self
    }

    pub fn fatal_connect(&self, device: &str, message: &str) -> &Self {
        self.state()
            .fatal_connects
            .insert(device.to_string(), message.to_string());
        self
    }

    /// 设备的前 `times` 次执行返回可恢复错误
    pub fn fail_executions(&self, device: &str, times: u32) -> &Self {
        self.state().execute_failures.insert(device.to_string(), times);
        self
    }

    /// 设定命令（或配置文本）的响应
    pub fn respond(&self, command: &str, response: MockResponse) -> &Self {
        self.state().responses.insert(command.to_string(), response);
        self
    }

    pub fn set_connect_delay(&self, delay: Duration) -> &Self {
        self.state().connect_delay = delay;
        self
    }

    pub fn set_execute_delay(&self, delay: Duration) -> &Self {
        self.state().execute_delay = delay;
        self
    }

    pub fn connects(&self) -> Vec<MockConnect> {
        self.state().connects.clone()
    }

    /// 设备的连接尝试次数（含失败）
    pub fn connect_count(&self, device: &str) -> usize {
        self.state()
            .connects
            .iter()
            .filter(|c| c.device == device)
            .count()
    }

    pub fn closes(&self) -> Vec<String> {
        self.state().closes.clone()
    }

    pub fn executions(&self) -> Vec<MockExecution> {
        self.state().executions.clone()
    }

    pub fn execution_count(&self, device: &str) -> usize {
        self.state()
            .executions
            .iter()
            .filter(|e| e.device == device)
            .count()
    }
}

#[async_trait]
impl ConnectionBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_redispatch(&self) -> bool {
        self.redispatch
    }

    async fn connect(
        &self,
        device: &Device,
        params: &ConnectionParams,
    ) -> Result<Box<dyn DeviceSession>, DriverError> {
        let delay = self.state().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut state = self.state();
            let result = if let Some(message) = state.fatal_connects.get(&device.name) {
                Err(DriverError::Fatal(message.clone()))
            } else if let Some(remaining) = state
                .connect_failures
                .get_mut(&device.name)
                .filter(|remaining| **remaining > 0)
            {
                *remaining -= 1;
                Err(DriverError::Transient("connection refused".to_string()))
            } else {
                match state.required_passwords.get(&device.name) {
                    Some(required) if params.password.as_deref() != Some(required.as_str()) => {
                        Err(DriverError::Auth(format!("invalid credentials for {}", device.name)))
                    }
                    _ => Ok(()),
                }
            };
            state.connects.push(MockConnect {
                device: device.name.clone(),
                params: params.clone(),
                succeeded: result.is_ok(),
            });
            result
        };

        result.map(|_| {
            Box::new(MockSession {
                device: device.name.clone(),
                state: Arc::clone(&self.state),
                closed: false,
            }) as Box<dyn DeviceSession>
        })
    }
}

struct MockSession {
    device: String,
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

impl MockSession {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeviceSession for MockSession {
    async fn execute(&mut self, operation: &str, params: &Value) -> Result<Value, DriverError> {
        let delay = self.state().execute_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.executions.push(MockExecution {
            device: self.device.clone(),
            operation: operation.to_string(),
            params: params.clone(),
        });

        if let Some(remaining) = state
            .execute_failures
            .get_mut(&self.device)
            .filter(|remaining| **remaining > 0)
        {
            *remaining -= 1;
            return Err(DriverError::Transient("device busy".to_string()));
        }

        let key = match operation {
            operations::CLI => params.get("command"),
            operations::CONFIG => params.get("config"),
            _ => None,
        }
        .and_then(Value::as_str)
        .unwrap_or_default();

        match state.responses.get(key) {
            Some(MockResponse::Output(value)) => Ok(value.clone()),
            Some(MockResponse::Transient(message)) => Err(DriverError::Transient(message.clone())),
            Some(MockResponse::Fatal(message)) => Err(DriverError::Fatal(message.clone())),
            None if operation == operations::CONFIG => Ok(Value::String("applied".to_string())),
            None => Ok(Value::String(format!("{}: {}", self.device, key))),
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            let device = self.device.clone();
            self.state().closes.push(device);
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_required_password() {
        let backend = MockBackend::new("mock");
        backend.require_password("r1", "secret");

        let mut device = Device::new("r1");
        device.password = Some("wrong".into());
        let err = backend.connect(&device, &device.base_params()).await.err();
        assert!(matches!(err, Some(DriverError::Auth(_))));

        device.password = Some("secret".into());
        assert!(backend.connect(&device, &device.base_params()).await.is_ok());
        assert_eq!(backend.connect_count("r1"), 2);
        assert!(!backend.connects()[0].succeeded);
    }

    #[tokio::test]
    async fn test_scripted_responses_and_failures() {
        let backend = MockBackend::new("mock");
        backend
            .fail_executions("r1", 1)
            .respond("show version", MockResponse::Output(json!("v1.0")));

        let device = Device::new("r1");
        let mut session = backend.connect(&device, &device.base_params()).await.unwrap();
        let params = json!({"command": "show version"});

        assert!(matches!(
            session.execute(operations::CLI, &params).await,
            Err(DriverError::Transient(_))
        ));
        assert_eq!(session.execute(operations::CLI, &params).await.unwrap(), json!("v1.0"));
        assert_eq!(
            session
                .execute(operations::CLI, &json!({"command": "show clock"}))
                .await
                .unwrap(),
            json!("r1: show clock")
        );

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(backend.closes(), vec!["r1".to_string()]);
        assert_eq!(backend.execution_count("r1"), 3);
    }
}
