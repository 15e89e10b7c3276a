//! Worker内存缓存
//!
//! 两个作用域：按设备的缓存和所有设备共享的默认缓存。缓存只由作业完成处理
//! 写入，由显式清除操作删除；库存刷新或Worker重启时整体丢弃。

use std::collections::BTreeMap;

use fleetd_core::models::{CacheTarget, WriteMode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// 缓存作用域
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    Device(String),
    Defaults,
}

impl CacheScope {
    pub fn device(name: impl Into<String>) -> Self {
        CacheScope::Device(name.into())
    }

    /// 根据缓存指令的目标和当前设备确定作用域
    pub fn for_target(target: CacheTarget, device: &str) -> Self {
        match target {
            CacheTarget::Device => CacheScope::Device(device.to_string()),
            CacheTarget::Defaults => CacheScope::Defaults,
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheStore {
    defaults: Map<String, Value>,
    devices: BTreeMap<String, Map<String, Value>>,
    /// 写入和清除时同步维护的大致字节数
    bytes: usize,
}

fn encoded_len(value: &Value) -> usize {
    serde_json::to_vec(value).map_or(0, |encoded| encoded.len())
}

fn entry_bytes(key: &str, value: &Value) -> usize {
    key.len() + encoded_len(value)
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(&self, scope: &CacheScope) -> Option<&Map<String, Value>> {
        match scope {
            CacheScope::Defaults => Some(&self.defaults),
            CacheScope::Device(name) => self.devices.get(name),
        }
    }

    fn scope_mut(&mut self, scope: &CacheScope) -> &mut Map<String, Value> {
        match scope {
            CacheScope::Defaults => &mut self.defaults,
            CacheScope::Device(name) => self.devices.entry(name.clone()).or_default(),
        }
    }

    pub fn put(&mut self, scope: &CacheScope, key: &str, value: Value, mode: WriteMode) {
        let added = encoded_len(&value);
        let entries = self.scope_mut(scope);
        let (freed, grown) = match mode {
            WriteMode::Overwrite => {
                let freed = entries
                    .insert(key.to_string(), value)
                    .map_or(0, |old| entry_bytes(key, &old));
                (freed, key.len() + added)
            }
            WriteMode::Accumulate => {
                let slot = entries.entry(key.to_string()).or_insert(Value::Null);
                let grown = if let Value::Array(items) = slot {
                    items.push(value);
                    added + 1
                } else if slot.is_null() {
                    *slot = Value::Array(vec![value]);
                    key.len() + added + 2
                } else {
                    let previous = slot.take();
                    *slot = Value::Array(vec![previous, value]);
                    added + 3
                };
                (0, grown)
            }
        };
        self.bytes = (self.bytes + grown).saturating_sub(freed);
        debug!("缓存写入: {:?} {} ({:?})", scope, key, mode);
    }

    pub fn get(&self, scope: &CacheScope, key: &str) -> Option<&Value> {
        self.scope(scope).and_then(|entries| entries.get(key))
    }

    /// 清除缓存
    ///
    /// `keys` 为空时清除整个作用域，否则只删除列出的键；不存在的键直接忽略。
    /// 返回实际删除的条目数。
    pub fn clear(&mut self, scope: &CacheScope, keys: Option<&[String]>) -> usize {
        let removed: Vec<(String, Value)> = match keys {
            None => match scope {
                CacheScope::Defaults => std::mem::take(&mut self.defaults).into_iter().collect(),
                CacheScope::Device(name) => self
                    .devices
                    .remove(name)
                    .map(|entries| entries.into_iter().collect())
                    .unwrap_or_default(),
            },
            Some(keys) => {
                let removed: Vec<(String, Value)> = match scope {
                    CacheScope::Defaults => Some(&mut self.defaults),
                    CacheScope::Device(name) => self.devices.get_mut(name),
                }
                .map(|entries| {
                    keys.iter()
                        .filter_map(|k| entries.remove(k).map(|value| (k.clone(), value)))
                        .collect()
                })
                .unwrap_or_default();
                if let CacheScope::Device(name) = scope {
                    if self.devices.get(name).is_some_and(Map::is_empty) {
                        self.devices.remove(name);
                    }
                }
                removed
            }
        };

        let freed: usize = removed.iter().map(|(k, v)| entry_bytes(k, v)).sum();
        self.bytes = self.bytes.saturating_sub(freed);
        removed.len()
    }

    /// 清除所有作用域
    pub fn clear_all(&mut self) -> usize {
        let removed = self.len();
        self.defaults.clear();
        self.devices.clear();
        self.bytes = 0;
        removed
    }

    /// 设备可见的缓存：默认缓存叠加设备缓存
    pub fn device_view(&self, device: &str) -> Map<String, Value> {
        let mut view = self.defaults.clone();
        if let Some(entries) = self.devices.get(device) {
            for (key, value) in entries {
                view.insert(key.clone(), value.clone());
            }
        }
        view
    }

    pub fn len(&self) -> usize {
        self.defaults.len() + self.devices.values().map(Map::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 缓存内容的JSON视图，供 `cache_get` 管理函数使用
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "defaults": self.defaults,
            "devices": self.devices,
        })
    }

    /// 缓存内容的大致字节数
    pub fn approximate_bytes(&self) -> usize {
        self.bytes
    }
}
