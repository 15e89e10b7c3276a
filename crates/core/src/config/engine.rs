use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 作业执行配置（对应 `[engine]`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub workers: usize,
    /// 单个Worker内同时执行的设备操作上限
    pub max_concurrency: usize,
    pub job_wait_timeout_seconds: u64,
    pub job_timeout_seconds: u64,
    pub filter_required: bool,
    pub default_backend: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            max_concurrency: 10,
            job_wait_timeout_seconds: 600,
            job_timeout_seconds: 300,
            filter_required: false,
            default_backend: "shell".to_string(),
        }
    }
}

impl ExecutionConfig {
    pub fn job_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.job_wait_timeout_seconds)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            return Err(anyhow::anyhow!("Worker数量必须大于0"));
        }
        if self.max_concurrency == 0 {
            return Err(anyhow::anyhow!("最大并发设备数必须大于0"));
        }
        if self.job_wait_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("作业等待超时必须大于0"));
        }
        if self.job_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("作业执行超时必须大于0"));
        }
        if self.default_backend.is_empty() {
            return Err(anyhow::anyhow!("默认连接后端不能为空"));
        }
        Ok(())
    }
}

/// 连接与重试配置（对应 `[connections]`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 为0时关闭空闲清理
    pub idle_timeout_seconds: u64,
    pub connect_retry: u32,
    pub task_retry: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter_factor: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 300,
            connect_retry: 3,
            task_retry: 1,
            backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            jitter_factor: 0.1,
        }
    }
}

impl ConnectionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_seconds > 0).then(|| Duration::from_secs(self.idle_timeout_seconds))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1.0"));
        }
        if self.max_backoff_ms < self.backoff_ms {
            return Err(anyhow::anyhow!("最大退避时间不能小于初始退避时间"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!(
                "抖动因子必须在0.0到1.0之间: {}",
                self.jitter_factor
            ));
        }
        Ok(())
    }
}

/// 内存超限时的处理动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAction {
    #[default]
    Log,
    Restart,
}

/// Watchdog读取内存占用的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryProbeKind {
    /// Worker按持有的资源自行估算
    #[default]
    Estimate,
    /// 进程常驻内存，所有Worker读数相同
    Process,
}

/// Watchdog配置（对应 `[watchdog]`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_seconds: u64,
    pub memory_threshold_mbyte: f64,
    pub memory_threshold_action: MemoryAction,
    pub memory_probe: MemoryProbeKind,
    /// 为0时不按存活时长重启
    pub child_process_max_age_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            memory_threshold_mbyte: 1000.0,
            memory_threshold_action: MemoryAction::Log,
            memory_probe: MemoryProbeKind::Estimate,
            child_process_max_age_seconds: 86_400,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn max_age(&self) -> Option<Duration> {
        (self.child_process_max_age_seconds > 0)
            .then(|| Duration::from_secs(self.child_process_max_age_seconds))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("Watchdog检查间隔必须大于0"));
        }
        if self.memory_threshold_mbyte <= 0.0 {
            return Err(anyhow::anyhow!("内存阈值必须大于0"));
        }
        Ok(())
    }
}

/// 文件存储配置（对应 `[artifacts]`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub base_dir: PathBuf,
    pub files_max_count: usize,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data/artifacts"),
            files_max_count: 5,
        }
    }
}

impl ArtifactConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("文件存储目录不能为空"));
        }
        if self.files_max_count == 0 {
            return Err(anyhow::anyhow!("文件保留数量必须大于0"));
        }
        Ok(())
    }
}

/// 传给 `Controller::start` 的引擎配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: ExecutionConfig,
    #[serde(default)]
    pub connections: ConnectionConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        self.engine.validate().context("引擎配置验证失败")?;
        self.connections.validate().context("连接配置验证失败")?;
        self.watchdog.validate().context("Watchdog配置验证失败")?;
        self.artifacts.validate().context("文件存储配置验证失败")?;
        Ok(())
    }
}
