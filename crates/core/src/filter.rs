use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::Device;
use crate::{EngineError, EngineResult};

/// 主机过滤条件
///
/// 所有已设置的条件按 AND 组合。未设置任何条件时匹配全部设备。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostFilter {
    /// 按名称的glob匹配
    #[serde(rename = "FB", default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
    /// 名称精确列表
    #[serde(rename = "FL", default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<String>>,
    /// 名称包含
    #[serde(rename = "FC", default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    /// 分组成员
    #[serde(rename = "FG", default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// 按名称的glob排除
    #[serde(rename = "FX", default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
    /// 主机地址前缀
    #[serde(rename = "FP", default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl HostFilter {
    pub fn glob(pattern: impl Into<String>) -> Self {
        Self {
            glob: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            list: Some(names.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.glob.is_none()
            && self.list.is_none()
            && self.contains.is_none()
            && self.group.is_none()
            && self.exclude.is_none()
            && self.prefix.is_none()
    }

    /// 编译后的匹配器
    fn compile(&self) -> EngineResult<CompiledFilter<'_>> {
        Ok(CompiledFilter {
            filter: self,
            glob: self.glob.as_deref().map(glob_to_regex).transpose()?,
            exclude: self.exclude.as_deref().map(glob_to_regex).transpose()?,
        })
    }

    /// 将过滤条件解析为具体设备名列表（按名称排序）
    pub fn resolve(&self, devices: &BTreeMap<String, Device>) -> EngineResult<Vec<String>> {
        let compiled = self.compile()?;
        Ok(devices
            .values()
            .filter(|device| compiled.matches(device))
            .map(|device| device.name.clone())
            .collect())
    }
}

struct CompiledFilter<'a> {
    filter: &'a HostFilter,
    glob: Option<Regex>,
    exclude: Option<Regex>,
}

impl CompiledFilter<'_> {
    fn matches(&self, device: &Device) -> bool {
        let name = device.name.as_str();

        if let Some(glob) = &self.glob {
            if !glob.is_match(name) {
                return false;
            }
        }
        if let Some(list) = &self.filter.list {
            if !list.iter().any(|n| n == name) {
                return false;
            }
        }
        if let Some(needle) = &self.filter.contains {
            if !name.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(group) = &self.filter.group {
            if !device.in_group(group) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(name) {
                return false;
            }
        }
        if let Some(prefix) = &self.filter.prefix {
            let address = device.hostname.as_deref().unwrap_or(name);
            if !address.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

fn glob_to_regex(pattern: &str) -> EngineResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
        .map_err(|e| EngineError::InvalidParameters(format!("无效的glob模式 {pattern}: {e}")))
}
