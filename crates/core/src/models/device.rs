use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{EngineError, EngineResult};

/// 连接参数
///
/// 主机、分组、默认值、via路径和凭据配置都使用同一结构，
/// 按优先级逐层合并。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// 传输层提示等后端特定参数
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Map<String, Value>,
}

impl ConnectionParams {
    /// 用 `other` 中已设置的字段覆盖当前值
    pub fn merge(&mut self, other: &ConnectionParams) {
        if other.hostname.is_some() {
            self.hostname = other.hostname.clone();
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.username.is_some() {
            self.username = other.username.clone();
        }
        if other.password.is_some() {
            self.password = other.password.clone();
        }
        if other.platform.is_some() {
            self.platform = other.platform.clone();
        }
        for (key, value) in &other.extras {
            self.extras.insert(key.clone(), value.clone());
        }
    }

    /// 仅填充当前未设置的字段
    fn fill_missing(&mut self, other: &ConnectionParams) {
        let mut merged = other.clone();
        merged.merge(self);
        *self = merged;
    }
}

/// 单个连接后端的参数，包含可选的via路径
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(flatten)]
    pub params: ConnectionParams,
    /// 备用路径（带外管理口、console等）
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub via: BTreeMap<String, ConnectionParams>,
}

/// 命名凭据配置，用于重连链
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub params: ConnectionParams,
}

/// 受管设备
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub connection_options: BTreeMap<String, ConnectionOptions>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// 设备自身的基础连接参数
    pub fn base_params(&self) -> ConnectionParams {
        ConnectionParams {
            hostname: self.hostname.clone().or_else(|| Some(self.name.clone())),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            platform: self.platform.clone(),
            extras: Map::new(),
        }
    }

    /// 解析指定后端（及可选via路径）的最终连接参数
    pub fn connection_params(
        &self,
        backend: &str,
        via: Option<&str>,
    ) -> EngineResult<ConnectionParams> {
        let mut params = self.base_params();
        let options = self.connection_options.get(backend);
        if let Some(options) = options {
            params.merge(&options.params);
        }

        if let Some(via) = via {
            let via_params = options
                .and_then(|options| options.via.get(via))
                .ok_or_else(|| EngineError::ViaParametersNotFound {
                    device: self.name.clone(),
                    backend: backend.to_string(),
                    via: via.to_string(),
                })?;
            params.merge(via_params);
        }

        Ok(params)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// 设备分组，为成员提供继承属性
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default)]
    pub connection_options: BTreeMap<String, ConnectionOptions>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// 库存默认值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(flatten)]
    pub attributes: Group,
    /// 可在重连链中按名称引用的凭据
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialProfile>,
}

/// 设备库存
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub hosts: BTreeMap<String, Device>,
    #[serde(default)]
    pub groups: BTreeMap<String, Group>,
    #[serde(default)]
    pub defaults: Defaults,
}

impl Inventory {
    pub fn from_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            hosts: devices.into_iter().map(|d| (d.name.clone(), d)).collect(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn credential(&self, name: &str) -> Option<&CredentialProfile> {
        self.defaults.credentials.get(name)
    }

    /// 展开继承关系：主机 > 先列出的分组 > 后列出的分组 > 默认值
    pub fn resolve(&self) -> BTreeMap<String, Device> {
        self.hosts
            .iter()
            .map(|(name, host)| (name.clone(), self.resolve_host(name, host)))
            .collect()
    }

    fn resolve_host(&self, name: &str, host: &Device) -> Device {
        let mut device = host.clone();
        device.name = name.to_string();

        let layers: Vec<&Group> = host
            .groups
            .iter()
            .filter_map(|g| self.groups.get(g))
            .chain(std::iter::once(&self.defaults.attributes))
            .collect();

        for layer in &layers {
            device.port = device.port.or(layer.port);
            if device.username.is_none() {
                device.username = layer.username.clone();
            }
            if device.password.is_none() {
                device.password = layer.password.clone();
            }
            if device.platform.is_none() {
                device.platform = layer.platform.clone();
            }
            for (key, value) in &layer.data {
                device.data.entry(key.clone()).or_insert_with(|| value.clone());
            }
            for (backend, options) in &layer.connection_options {
                let entry = device.connection_options.entry(backend.clone()).or_default();
                entry.params.fill_missing(&options.params);
                for (via, params) in &options.via {
                    entry
                        .via
                        .entry(via.clone())
                        .or_insert_with(|| params.clone());
                }
            }
        }

        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_inventory() -> Inventory {
        let inventory: Inventory = serde_json::from_value(json!({
            "hosts": {
                "r1": {
                    "hostname": "10.0.0.1",
                    "groups": ["core", "lab"],
                    "data": {"site": "dc1"},
                    "connection_options": {
                        "ssh": {"port": 2222, "via": {"oob": {"hostname": "10.9.9.1"}}}
                    }
                },
                "r2": {"username": "local"}
            },
            "groups": {
                "core": {"username": "core-admin", "data": {"role": "core"}},
                "lab": {"username": "lab-admin", "platform": "eos", "data": {"role": "lab"}}
            },
            "defaults": {
                "username": "admin",
                "password": "admin",
                "credentials": {"backup": {"username": "backup", "password": "b"}}
            }
        }))
        .unwrap();
        inventory
    }

    #[test]
    fn test_resolve_inheritance_order() {
        let devices = sample_inventory().resolve();
        let r1 = &devices["r1"];
        assert_eq!(r1.username.as_deref(), Some("core-admin"));
        assert_eq!(r1.platform.as_deref(), Some("eos"));
        assert_eq!(r1.password.as_deref(), Some("admin"));
        assert_eq!(r1.data["role"], json!("core"));
        assert_eq!(r1.data["site"], json!("dc1"));

        let r2 = &devices["r2"];
        assert_eq!(r2.username.as_deref(), Some("local"));
        assert_eq!(r2.name, "r2");
    }

    #[test]
    fn test_connection_params_with_via() {
        let devices = sample_inventory().resolve();
        let r1 = &devices["r1"];

        let primary = r1.connection_params("ssh", None).unwrap();
        assert_eq!(primary.hostname.as_deref(), Some("10.0.0.1"));
        assert_eq!(primary.port, Some(2222));

        let oob = r1.connection_params("ssh", Some("oob")).unwrap();
        assert_eq!(oob.hostname.as_deref(), Some("10.9.9.1"));
        assert_eq!(oob.port, Some(2222));

        let err = r1.connection_params("ssh", Some("console")).unwrap_err();
        assert!(matches!(err, EngineError::ViaParametersNotFound { .. }));
    }

    #[test]
    fn test_named_credentials() {
        let inventory = sample_inventory();
        let backup = inventory.credential("backup").unwrap();
        assert_eq!(backup.params.username.as_deref(), Some("backup"));
        assert!(inventory.credential("missing").is_none());
    }
}
