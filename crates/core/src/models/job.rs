use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::filter::HostFilter;
use crate::models::CredentialProfile;
use crate::EngineError;

/// 作业目标Worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Targeting {
    /// 自动选择空闲Worker
    #[default]
    Any,
    /// 广播到所有Worker
    All,
    /// 指定Worker索引
    Worker(usize),
}

impl FromStr for Targeting {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Targeting::Any),
            "all" => Ok(Targeting::All),
            other => other.parse::<usize>().map(Targeting::Worker).map_err(|_| {
                EngineError::InvalidParameters(format!("无效的目标Worker: {other}"))
            }),
        }
    }
}

impl fmt::Display for Targeting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Targeting::Any => write!(f, "any"),
            Targeting::All => write!(f, "all"),
            Targeting::Worker(index) => write!(f, "worker-{index}"),
        }
    }
}

/// 重连链条目：按名称引用库存凭据，或直接内联
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReconnectEntry {
    Named(String),
    Inline(CredentialProfile),
}

/// 作业级重试覆盖
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reconnect: Vec<ReconnectEntry>,
}

/// 缓存写入范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTarget {
    #[default]
    Device,
    Defaults,
}

/// 缓存写入模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Overwrite,
    Accumulate,
}

/// 作业完成后写入缓存的指令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDirective {
    pub key: String,
    #[serde(default)]
    pub target: CacheTarget,
    #[serde(default)]
    pub mode: WriteMode,
    /// 结果中的JSON Pointer，为空时写入整个结果
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,
}

/// 作业请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default = "Uuid::new_v4")]
    pub job_id: Uuid,
    pub function: String,
    #[serde(default)]
    pub filter: HostFilter,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub retry: RetryOverrides,
    #[serde(default)]
    pub targeting: Targeting,
    /// 连接后端，为空时使用引擎默认后端
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    #[serde(default)]
    pub force_reopen: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache: Vec<CacheDirective>,
    /// 将成功结果保存到该文件组
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_file: Option<String>,
    /// 与该文件组的最新版本做差异比较
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl JobRequest {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            function: function.into(),
            filter: HostFilter::default(),
            params: Map::new(),
            retry: RetryOverrides::default(),
            targeting: Targeting::Any,
            backend: None,
            via: None,
            force_reopen: false,
            cache: Vec::new(),
            to_file: None,
            diff: None,
            dry_run: false,
            timeout_seconds: None,
        }
    }

    pub fn with_filter(mut self, filter: HostFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_targeting(mut self, targeting: Targeting) -> Self {
        self.targeting = targeting;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_via(mut self, via: impl Into<String>) -> Self {
        self.via = Some(via.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryOverrides) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, directive: CacheDirective) -> Self {
        self.cache.push(directive);
        self
    }

    pub fn to_file(mut self, filegroup: impl Into<String>) -> Self {
        self.to_file = Some(filegroup.into());
        self
    }

    pub fn diff_against(mut self, filegroup: impl Into<String>) -> Self {
        self.diff = Some(filegroup.into());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// 读取字符串参数
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// 读取字符串列表参数，单个字符串视为只有一个元素的列表
    pub fn param_str_list(&self, key: &str) -> Vec<String> {
        match self.params.get(key) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn param_bool(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_targeting_from_str() {
        assert_eq!("any".parse::<Targeting>().unwrap(), Targeting::Any);
        assert_eq!("all".parse::<Targeting>().unwrap(), Targeting::All);
        assert_eq!("2".parse::<Targeting>().unwrap(), Targeting::Worker(2));
        assert!("two".parse::<Targeting>().is_err());
    }

    #[test]
    fn test_job_request_deserialize_defaults() {
        let request: JobRequest = serde_json::from_value(json!({
            "function": "cli",
            "filter": {"FB": "r*"},
            "params": {"commands": ["show version"]},
            "retry": {"connect_retry": 0, "reconnect": ["backup", {"username": "u", "password": "p"}]},
            "targeting": {"worker": 1}
        }))
        .unwrap();

        assert_eq!(request.targeting, Targeting::Worker(1));
        assert_eq!(request.retry.connect_retry, Some(0));
        assert_eq!(request.retry.reconnect.len(), 2);
        assert!(matches!(request.retry.reconnect[0], ReconnectEntry::Named(ref n) if n == "backup"));
        assert!(matches!(request.retry.reconnect[1], ReconnectEntry::Inline(_)));
        assert_eq!(request.param_str_list("commands"), vec!["show version".to_string()]);
        assert!(!request.dry_run);
    }
}
