use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 事件粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    Job,
    Device,
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Completed,
    Failed,
    /// Watchdog告警等非生命周期事件
    Warning,
}

/// 生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Option<Uuid>,
    pub worker: usize,
    pub scope: EventScope,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn job(job_id: Uuid, worker: usize, function: &str, status: EventStatus) -> Self {
        Self {
            job_id: Some(job_id),
            worker,
            scope: EventScope::Job,
            status,
            function: Some(function.to_string()),
            device: None,
            step: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn device(job_id: Uuid, worker: usize, device: &str, status: EventStatus) -> Self {
        Self {
            job_id: Some(job_id),
            worker,
            scope: EventScope::Device,
            status,
            function: None,
            device: Some(device.to_string()),
            step: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn step(
        job_id: Uuid,
        worker: usize,
        device: &str,
        step: &str,
        status: EventStatus,
    ) -> Self {
        Self {
            job_id: Some(job_id),
            worker,
            scope: EventScope::Step,
            status,
            function: None,
            device: Some(device.to_string()),
            step: Some(step.to_string()),
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Worker级告警（不属于任何作业）
    pub fn warning(worker: usize, message: impl Into<String>) -> Self {
        Self {
            job_id: None,
            worker,
            scope: EventScope::Job,
            status: EventStatus::Warning,
            function: None,
            device: None,
            step: None,
            message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
