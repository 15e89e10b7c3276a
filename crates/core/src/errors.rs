use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// 执行引擎错误类型定义
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("设备 {device} 通过 {backend} 连接失败（尝试 {attempts} 次）: {message}")]
    ConnectFailed {
        device: String,
        backend: String,
        attempts: u32,
        message: String,
    },

    #[error("设备 {device} 的 {backend} 连接未配置via参数: {via}")]
    ViaParametersNotFound {
        device: String,
        backend: String,
        via: String,
    },

    #[error("连接后端 {backend} 不支持路径重定向")]
    RedispatchUnsupported { backend: String },

    #[error("可恢复错误: {0}")]
    Transient(String),

    #[error("不可恢复错误: {0}")]
    Fatal(String),

    #[error("检查未通过: {0}")]
    CheckFailed(String),

    #[error("未提供主机过滤条件，拒绝对全部设备执行")]
    FilterRequired,

    #[error("Worker未找到: {index}（共 {workers} 个Worker）")]
    WorkerNotFound { index: usize, workers: usize },

    #[error("等待作业 {job_id} 结果超时（{waited:?}）")]
    Timeout { job_id: Uuid, waited: Duration },

    #[error("Worker {index} 不可用")]
    WorkerUnavailable { index: usize },

    #[error("未知的作业函数: {name}")]
    UnknownFunction { name: String },

    #[error("连接后端未注册: {name}")]
    BackendNotFound { name: String },

    #[error("无效的作业参数: {0}")]
    InvalidParameters(String),

    #[error("库存错误: {0}")]
    Inventory(String),

    #[error("文件存储错误 {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl EngineError {
    /// 文件存储的I/O错误，附带出错路径
    pub fn artifact(path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| EngineError::Artifact { path, source }
    }

    /// 错误分类，写入设备结果供调用方判断
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            EngineError::ViaParametersNotFound { .. } => ErrorKind::ViaParametersNotFound,
            EngineError::RedispatchUnsupported { .. } => ErrorKind::RedispatchUnsupported,
            EngineError::Transient(_) => ErrorKind::Transient,
            EngineError::Fatal(_) => ErrorKind::Fatal,
            EngineError::CheckFailed(_) => ErrorKind::CheckFailed,
            EngineError::FilterRequired => ErrorKind::FilterRequired,
            EngineError::WorkerNotFound { .. } => ErrorKind::WorkerNotFound,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::WorkerUnavailable { .. } => ErrorKind::WorkerUnavailable,
            EngineError::InvalidParameters(_) | EngineError::UnknownFunction { .. } => {
                ErrorKind::InvalidParameters
            }
            _ => ErrorKind::Internal,
        }
    }
}

/// 错误类别（可序列化，用于结果）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectFailed,
    ViaParametersNotFound,
    RedispatchUnsupported,
    Transient,
    Fatal,
    CheckFailed,
    FilterRequired,
    WorkerNotFound,
    Timeout,
    WorkerUnavailable,
    InvalidParameters,
    Internal,
}

/// 设备驱动返回的错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("authentication failed: {0}")]
    Auth(String),
}

/// 判断错误是否值得重试
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for DriverError {
    fn is_retryable(&self) -> bool {
        // 认证失败在连接重试轴上重试，凭据链由连接管理器负责
        matches!(self, DriverError::Transient(_) | DriverError::Auth(_))
    }
}

impl Retryable for EngineError {
    fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

impl From<DriverError> for EngineError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Transient(msg) => EngineError::Transient(msg),
            DriverError::Fatal(msg) | DriverError::Auth(msg) => EngineError::Fatal(msg),
        }
    }
}

/// 统一的Result类型
pub type EngineResult<T> = std::result::Result<T, EngineError>;
