//! 管理操作
//!
//! 管理操作不逐设备执行，而是直接作用于Worker自身的库存、连接、缓存和
//! 文件存储，结果放在 `JobResult.payload` 中。

use std::collections::BTreeMap;

use fleetd_core::models::{Device, JobRequest, WorkerStats};
use fleetd_core::traits::InventoryProvider;
use fleetd_core::{EngineError, EngineResult};
use fleetd_infrastructure::{ArtifactSelector, CacheScope};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::worker::WorkerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminOp {
    Inventory,
    Connections,
    Disconnect,
    Refresh,
    CacheGet,
    CacheClear,
    FileList,
    FileRead,
    FileDiff,
    FileRemove,
    Stats,
}

impl AdminOp {
    pub const ALL: [AdminOp; 11] = [
        AdminOp::Inventory,
        AdminOp::Connections,
        AdminOp::Disconnect,
        AdminOp::Refresh,
        AdminOp::CacheGet,
        AdminOp::CacheClear,
        AdminOp::FileList,
        AdminOp::FileRead,
        AdminOp::FileDiff,
        AdminOp::FileRemove,
        AdminOp::Stats,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AdminOp::Inventory => "inventory",
            AdminOp::Connections => "connections",
            AdminOp::Disconnect => "disconnect",
            AdminOp::Refresh => "refresh",
            AdminOp::CacheGet => "cache_get",
            AdminOp::CacheClear => "cache_clear",
            AdminOp::FileList => "file_list",
            AdminOp::FileRead => "file_read",
            AdminOp::FileDiff => "file_diff",
            AdminOp::FileRemove => "file_remove",
            AdminOp::Stats => "stats",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub(crate) async fn execute(
        self,
        request: &JobRequest,
        state: &mut WorkerState,
        stats: &WorkerStats,
        provider: &dyn InventoryProvider,
    ) -> EngineResult<Value> {
        match self {
            AdminOp::Inventory => inventory(request, state),
            AdminOp::Connections => {
                let connections = state.connections.list(request.param_str("backend")).await;
                Ok(json!({ "connections": connections }))
            }
            AdminOp::Disconnect => disconnect(request, state).await,
            AdminOp::Refresh => {
                let summary = state.refresh(provider).await?;
                info!(
                    "库存已刷新: {} 台设备，关闭 {} 个连接",
                    summary.inventory_size, summary.closed_connections
                );
                Ok(serde_json::to_value(summary)?)
            }
            AdminOp::CacheGet => cache_get(request, state),
            AdminOp::CacheClear => cache_clear(request, state),
            AdminOp::FileList => {
                let index = state
                    .artifacts
                    .list(request.param_str("filegroup"), request.param_str("device"));
                Ok(serde_json::to_value(index)?)
            }
            AdminOp::FileRead => file_read(request, state).await,
            AdminOp::FileDiff => file_diff(request, state).await,
            AdminOp::FileRemove => file_remove(request, state).await,
            AdminOp::Stats => Ok(serde_json::to_value(stats)?),
        }
    }
}

/// 过滤条件匹配的设备，空过滤条件返回 `None`
fn selected_devices(
    request: &JobRequest,
    state: &WorkerState,
) -> EngineResult<Option<Vec<String>>> {
    if request.filter.is_empty() {
        Ok(None)
    } else {
        request.filter.resolve(&state.devices).map(Some)
    }
}

fn required_str<'a>(request: &'a JobRequest, key: &str) -> EngineResult<&'a str> {
    request
        .param_str(key)
        .ok_or_else(|| EngineError::InvalidParameters(format!("缺少{key}参数")))
}

fn param_u64_list(request: &JobRequest, key: &str) -> Option<Vec<u64>> {
    request
        .params
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_u64).collect())
}

/// 去掉密码后的设备信息
fn redact(device: &Device) -> Device {
    let mut device = device.clone();
    device.password = None;
    for options in device.connection_options.values_mut() {
        options.params.password = None;
        for via in options.via.values_mut() {
            via.password = None;
        }
    }
    device
}

fn inventory(request: &JobRequest, state: &WorkerState) -> EngineResult<Value> {
    let names = selected_devices(request, state)?;
    let hosts: BTreeMap<&String, Device> = state
        .devices
        .iter()
        .filter(|(name, _)| names.as_ref().map_or(true, |names| names.contains(name)))
        .map(|(name, device)| (name, redact(device)))
        .collect();
    Ok(json!({
        "count": hosts.len(),
        "hosts": hosts,
        "groups": state.inventory.groups.keys().collect::<Vec<_>>(),
    }))
}

async fn disconnect(request: &JobRequest, state: &mut WorkerState) -> EngineResult<Value> {
    let names = selected_devices(request, state)?;
    let closed = state
        .connections
        .close_matching(request.param_str("backend"), names.as_deref())
        .await;
    let closed: Vec<Value> = closed
        .into_iter()
        .map(|(backend, device)| json!({ "backend": backend, "device": device }))
        .collect();
    Ok(json!({ "count": closed.len(), "closed": closed }))
}

fn cache_get(request: &JobRequest, state: &WorkerState) -> EngineResult<Value> {
    let names = selected_devices(request, state)?;
    let key = request.param_str("key");
    if names.is_none() && key.is_none() {
        return Ok(state.cache.to_value());
    }

    let names = names.unwrap_or_else(|| state.devices.keys().cloned().collect());
    let mut devices = Map::new();
    for name in names {
        let value = match key {
            Some(key) => match state.cache.get(&CacheScope::device(name.as_str()), key) {
                Some(value) => value.clone(),
                None => continue,
            },
            None => Value::Object(state.cache.device_view(&name)),
        };
        devices.insert(name, value);
    }

    let defaults = match key {
        Some(key) => state.cache.get(&CacheScope::Defaults, key).cloned(),
        None => None,
    };
    Ok(json!({ "defaults": defaults, "devices": devices }))
}

fn cache_clear(request: &JobRequest, state: &mut WorkerState) -> EngineResult<Value> {
    let names = selected_devices(request, state)?;
    let keys = request.params.contains_key("keys").then(|| request.param_str_list("keys"));
    let keys = keys.as_deref();

    let cleared = if request.param_str("scope") == Some("defaults") {
        state.cache.clear(&CacheScope::Defaults, keys)
    } else if let Some(names) = names {
        names
            .iter()
            .map(|name| state.cache.clear(&CacheScope::device(name.as_str()), keys))
            .sum::<usize>()
    } else if keys.is_none() {
        state.cache.clear_all()
    } else {
        let devices: Vec<String> = state.devices.keys().cloned().collect();
        state.cache.clear(&CacheScope::Defaults, keys)
            + devices
                .iter()
                .map(|name| state.cache.clear(&CacheScope::device(name.as_str()), keys))
                .sum::<usize>()
    };
    Ok(json!({ "cleared": cleared }))
}

/// 文件操作涉及的设备：过滤条件匹配的设备，或文件组中已有记录的全部设备
fn artifact_devices(
    request: &JobRequest,
    state: &WorkerState,
    filegroup: &str,
) -> EngineResult<Vec<String>> {
    match selected_devices(request, state)? {
        Some(names) => Ok(names),
        None => Ok(state
            .artifacts
            .list(Some(filegroup), None)
            .filegroups
            .get(filegroup)
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default()),
    }
}

fn selector(request: &JobRequest) -> ArtifactSelector {
    if let Some(generations) = param_u64_list(request, "generations") {
        ArtifactSelector::Generations(generations)
    } else if let Some(positions) = param_u64_list(request, "recent") {
        ArtifactSelector::Recent(positions.into_iter().map(|p| p as usize).collect())
    } else {
        match request.params.get("last").and_then(Value::as_u64) {
            Some(n) if n > 1 => ArtifactSelector::LastN(n as usize),
            _ => ArtifactSelector::Last,
        }
    }
}

async fn file_read(request: &JobRequest, state: &WorkerState) -> EngineResult<Value> {
    let filegroup = required_str(request, "filegroup")?;
    let selector = selector(request);
    let mut devices = Map::new();
    for name in artifact_devices(request, state, filegroup)? {
        let artifacts = state.artifacts.read(filegroup, &name, &selector).await?;
        devices.insert(name, serde_json::to_value(artifacts)?);
    }
    Ok(Value::Object(devices))
}

async fn file_diff(request: &JobRequest, state: &WorkerState) -> EngineResult<Value> {
    let filegroup = required_str(request, "filegroup")?;
    let position = |key: &str, default: usize| {
        request
            .params
            .get(key)
            .and_then(Value::as_u64)
            .map_or(default, |p| p as usize)
    };
    let (a, b) = (position("a", 2), position("b", 1));

    let mut devices = Map::new();
    for name in artifact_devices(request, state, filegroup)? {
        let diff = state.artifacts.diff(filegroup, &name, a, b).await?;
        devices.insert(name, json!(diff));
    }
    Ok(Value::Object(devices))
}

async fn file_remove(request: &JobRequest, state: &mut WorkerState) -> EngineResult<Value> {
    let filegroup = required_str(request, "filegroup")?;
    let removed = match selected_devices(request, state)? {
        None => state.artifacts.remove(filegroup, None).await?,
        Some(names) => {
            let mut removed = 0;
            for name in names {
                removed += state.artifacts.remove(filegroup, Some(&name)).await?;
            }
            removed
        }
    };
    Ok(json!({ "removed": removed }))
}
