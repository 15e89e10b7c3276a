//! 作业函数注册表
//!
//! 函数名在部署时确定，映射到两类处理器：逐设备执行的 `DeviceTask`，
//! 以及直接作用于Worker自身状态的管理操作 `AdminOp`。

pub mod admin;
pub mod device;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleetd_core::models::{Device, EventStatus, JobEvent, JobRequest};
use fleetd_core::traits::Renderer;
use fleetd_core::{EngineError, EngineResult};
use fleetd_infrastructure::EventBus;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::connection::ConnectionLease;
pub use admin::AdminOp;
pub use device::{CfgTask, CliTask, TestTask};

/// 设备任务的输出
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub result: Value,
    /// 任务正常结束但结果判定为失败（例如检查未通过）
    pub failed: bool,
    pub message: Option<String>,
}

impl TaskOutput {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            failed: false,
            message: None,
        }
    }

    pub fn failed(result: Value, message: impl Into<String>) -> Self {
        Self {
            result,
            failed: true,
            message: Some(message.into()),
        }
    }
}

/// 子步骤事件发送器，同一设备内的事件按调用顺序发出
pub struct StepEmitter {
    bus: Arc<EventBus>,
    job_id: Uuid,
    worker: usize,
    device: String,
}

impl StepEmitter {
    pub fn new(bus: Arc<EventBus>, job_id: Uuid, worker: usize, device: &str) -> Self {
        Self {
            bus,
            job_id,
            worker,
            device: device.to_string(),
        }
    }

    pub fn started(&self, step: &str) {
        self.emit(step, EventStatus::Started, None);
    }

    pub fn completed(&self, step: &str) {
        self.emit(step, EventStatus::Completed, None);
    }

    pub fn failed(&self, step: &str, message: &str) {
        self.emit(step, EventStatus::Failed, Some(message));
    }

    fn emit(&self, step: &str, status: EventStatus, message: Option<&str>) {
        let mut event = JobEvent::step(self.job_id, self.worker, &self.device, step, status);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.bus.publish(event);
    }
}

/// 单台设备的执行上下文
pub struct TaskContext<'a> {
    pub request: &'a JobRequest,
    pub device: &'a Device,
    pub lease: Option<&'a ConnectionLease>,
    pub renderer: &'a dyn Renderer,
    /// 设备缓存视图（默认值叠加设备自身的条目）
    pub cache: &'a Map<String, Value>,
    pub steps: &'a StepEmitter,
}

impl TaskContext<'_> {
    /// 在设备会话上执行一个操作
    pub async fn execute(&self, operation: &str, params: Value) -> EngineResult<Value> {
        let lease = self.lease.ok_or_else(|| {
            EngineError::Internal(format!("设备 {} 没有可用连接", self.device.name))
        })?;
        let mut session = lease.session().await;
        Ok(session.execute(operation, &params).await?)
    }

    /// 使用设备和作业参数渲染模板
    pub fn render(&self, template: &str) -> EngineResult<String> {
        self.renderer
            .render(template, self.device, &self.request.params)
    }

    /// 执行一个子步骤并发出开始、完成或失败事件
    pub async fn step(&self, name: &str, operation: &str, params: Value) -> EngineResult<Value> {
        self.steps.started(name);
        match self.execute(operation, params).await {
            Ok(output) => {
                self.steps.completed(name);
                Ok(output)
            }
            Err(e) => {
                self.steps.failed(name, &e.to_string());
                Err(e)
            }
        }
    }
}

/// 逐设备执行的任务
#[async_trait]
pub trait DeviceTask: Send + Sync {
    /// 是否需要先打开设备连接
    fn needs_connection(&self, request: &JobRequest) -> bool {
        !request.dry_run
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> EngineResult<TaskOutput>;
}

/// 函数名对应的处理器
#[derive(Clone)]
pub enum FunctionHandler {
    Device(Arc<dyn DeviceTask>),
    Admin(AdminOp),
}

pub struct FunctionRegistry {
    handlers: HashMap<String, FunctionHandler>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// 内置设备任务和全部管理操作
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_task("cli", Arc::new(CliTask));
        registry.register_task("cfg", Arc::new(CfgTask));
        registry.register_task("test", Arc::new(TestTask));
        for op in AdminOp::ALL {
            registry
                .handlers
                .insert(op.name().to_string(), FunctionHandler::Admin(op));
        }
        registry
    }

    pub fn register_task(&mut self, name: impl Into<String>, task: Arc<dyn DeviceTask>) {
        self.handlers.insert(name.into(), FunctionHandler::Device(task));
    }

    pub fn get(&self, name: &str) -> Option<FunctionHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
