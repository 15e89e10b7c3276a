use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{EngineError, ErrorKind};

/// 错误详情
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for ErrorDetail {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// 单台设备的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceResult {
    pub device: String,
    pub failed: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// 连接尝试次数（含凭据链）
    #[serde(default)]
    pub connect_attempts: u32,
    /// 消耗的任务重试次数
    #[serde(default)]
    pub task_retries: u32,
    /// 成功连接所用的重连链索引，None 表示主凭据
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl DeviceResult {
    pub fn success(device: impl Into<String>, result: Value) -> Self {
        Self {
            device: device.into(),
            failed: false,
            result,
            error: None,
            connect_attempts: 0,
            task_retries: 0,
            profile_index: None,
            diff: None,
        }
    }

    pub fn failure(device: impl Into<String>, err: &EngineError) -> Self {
        Self {
            device: device.into(),
            failed: true,
            result: Value::Null,
            error: Some(ErrorDetail::from(err)),
            connect_attempts: 0,
            task_retries: 0,
            profile_index: None,
            diff: None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// 作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// 作业已执行完毕（设备级失败属于正常结果）
    Completed,
    /// 作业级错误，例如未知函数或过滤保护
    Failed,
}

/// 作业结果，进入结果队列后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub function: String,
    pub worker: usize,
    pub status: JobStatus,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceResult>,
    /// Worker级函数（如 file_list、stats）的结果
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn is_failed(&self) -> bool {
        self.status == JobStatus::Failed
    }

    pub fn failed_devices(&self) -> Vec<&str> {
        self.devices
            .values()
            .filter(|r| r.failed)
            .map(|r| r.device.as_str())
            .collect()
    }

    pub fn succeeded_devices(&self) -> Vec<&str> {
        self.devices
            .values()
            .filter(|r| !r.failed)
            .map(|r| r.device.as_str())
            .collect()
    }

    pub fn device(&self, name: &str) -> Option<&DeviceResult> {
        self.devices.get(name)
    }
}

/// 调用方等待作业的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(JobResult),
    /// 等待超时，作业仍在Worker中继续执行，结果会进入结果队列
    Timeout { job_id: Uuid, worker: usize },
    /// Worker在执行中被重启
    Unavailable { job_id: Uuid, worker: usize },
}

impl JobOutcome {
    pub fn result(&self) -> Option<&JobResult> {
        match self {
            JobOutcome::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_result(self) -> Option<JobResult> {
        match self {
            JobOutcome::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, JobOutcome::Timeout { .. })
    }
}

/// `submit` 的返回值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    Single(JobOutcome),
    /// 广播作业：Worker索引 -> 结果
    Broadcast(BTreeMap<usize, JobOutcome>),
}

impl SubmitResponse {
    pub fn single(self) -> Option<JobOutcome> {
        match self {
            SubmitResponse::Single(outcome) => Some(outcome),
            SubmitResponse::Broadcast(_) => None,
        }
    }

    pub fn broadcast(self) -> Option<BTreeMap<usize, JobOutcome>> {
        match self {
            SubmitResponse::Broadcast(outcomes) => Some(outcomes),
            SubmitResponse::Single(_) => None,
        }
    }
}
