//! 设备连接管理
//!
//! 每个Worker独占一个 `ConnectionManager`，按 (后端, 设备) 保存已打开的会话。
//! 使用中的连接通过 `ConnectionLease` 计数，空闲清理只会关闭计数为零的连接，
//! 计数的增减和清理的判断都在同一把表锁下完成。

mod slot;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetd_core::models::{ConnectionParams, CredentialProfile, Device};
use fleetd_core::traits::ConnectionBackend;
use fleetd_core::{DriverError, EngineError, EngineResult};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backends::BackendRegistry;
use crate::retry::{RetryController, RetryPolicy};
pub use slot::ConnectionLease;
use slot::ConnectionSlot;

type SlotMap = HashMap<(String, String), Arc<ConnectionSlot>>;

/// 打开连接的请求
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub device: &'a Device,
    pub backend: &'a str,
    pub via: Option<&'a str>,
    pub force_reopen: bool,
    pub connect: &'a RetryPolicy,
    /// 主凭据失败后依次尝试的凭据
    pub reconnect: &'a [CredentialProfile],
}

/// 对外展示的连接信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub backend: String,
    pub device: String,
    pub opened_at: DateTime<Utc>,
    pub idle_seconds: f64,
    pub in_use: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

/// `close` 的结果，关闭不存在的连接不是错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Closed,
    NothingToClose,
}

pub struct ConnectionManager {
    worker: usize,
    backends: Arc<BackendRegistry>,
    slots: Arc<RwLock<SlotMap>>,
    sweeper: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(worker: usize, backends: Arc<BackendRegistry>) -> Self {
        Self {
            worker,
            backends,
            slots: Arc::new(RwLock::new(HashMap::new())),
            sweeper: None,
        }
    }

    /// 启动空闲清理任务，间隔等于空闲超时
    pub fn start_idle_sweeper(&mut self, idle_timeout: Duration) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
        let slots = Arc::clone(&self.slots);
        let worker = self.worker;
        self.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle_timeout);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let closed = sweep(&slots, idle_timeout).await;
                if closed > 0 {
                    info!("Worker {} 空闲清理关闭了 {} 个连接", worker, closed);
                }
            }
        }));
        debug!("Worker {} 启动空闲连接清理，超时 {:?}", self.worker, idle_timeout);
    }

    /// 获取或打开连接
    pub async fn open(&self, request: OpenRequest<'_>) -> EngineResult<ConnectionLease> {
        let backend = self
            .backends
            .get(request.backend)
            .ok_or_else(|| EngineError::BackendNotFound {
                name: request.backend.to_string(),
            })?;

        if request.via.is_some() && !backend.supports_redispatch() {
            return Err(EngineError::RedispatchUnsupported {
                backend: request.backend.to_string(),
            });
        }
        let primary = request
            .device
            .connection_params(request.backend, request.via)?;

        let key = (request.backend.to_string(), request.device.name.clone());

        if request.force_reopen {
            if let Some(old) = self.slots.write().await.remove(&key) {
                debug!("强制重连，关闭旧连接: {:?}", key);
                close_slot(&old).await;
            }
        } else {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(&key) {
                if slot.is_alive() && slot.via() == request.via {
                    return Ok(ConnectionLease::acquire(Arc::clone(slot), false));
                }
            }
        }

        let slot = Arc::new(self.connect(backend.as_ref(), &request, primary).await?);
        let lease = ConnectionLease::acquire(Arc::clone(&slot), true);

        let previous = self.slots.write().await.insert(key, slot);
        if let Some(previous) = previous {
            close_slot(&previous).await;
        }
        counter!("fleetd_connections_opened_total", "backend" => request.backend.to_string())
            .increment(1);
        Ok(lease)
    }

    /// 依次尝试主凭据和重连链中的凭据
    async fn connect(
        &self,
        backend: &dyn ConnectionBackend,
        request: &OpenRequest<'_>,
        primary: ConnectionParams,
    ) -> EngineResult<ConnectionSlot> {
        let device = request.device;
        let profiles = std::iter::once(primary.clone()).chain(request.reconnect.iter().map(|p| {
            let mut params = primary.clone();
            params.merge(&p.params);
            params
        }));

        let mut total_attempts = 0u32;
        let mut last_error: Option<DriverError> = None;

        for (index, params) in profiles.enumerate() {
            let profile_index = index.checked_sub(1);
            let outcome = RetryController::with_retry(
                request.connect,
                |attempt| {
                    debug!(
                        "连接 {} ({}) 凭据 {:?} 第 {} 次尝试",
                        device.name,
                        request.backend,
                        profile_index,
                        attempt + 1
                    );
                    backend.connect(device, &params)
                },
                |err, attempts| {
                    warn!(
                        "设备 {} 凭据 {:?} 连接 {} 次均失败: {}",
                        device.name, profile_index, attempts, err
                    );
                },
            )
            .await;
            total_attempts += outcome.attempts;

            match outcome.result {
                Ok(session) => {
                    if let Some(index) = profile_index {
                        info!("设备 {} 使用重连链第 {} 个凭据连接成功", device.name, index);
                    }
                    return Ok(ConnectionSlot::new(
                        request.backend,
                        &device.name,
                        session,
                        profile_index,
                        request.via.map(str::to_string),
                        total_attempts,
                    ));
                }
                Err(DriverError::Fatal(message)) => {
                    return Err(EngineError::ConnectFailed {
                        device: device.name.clone(),
                        backend: request.backend.to_string(),
                        attempts: total_attempts,
                        message,
                    });
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(EngineError::ConnectFailed {
            device: device.name.clone(),
            backend: request.backend.to_string(),
            attempts: total_attempts,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "没有可用的凭据".to_string()),
        })
    }

    pub async fn close(&self, backend: &str, device: &str) -> CloseStatus {
        let removed = self
            .slots
            .write()
            .await
            .remove(&(backend.to_string(), device.to_string()));
        match removed {
            Some(slot) => {
                close_slot(&slot).await;
                CloseStatus::Closed
            }
            None => {
                debug!("没有需要关闭的连接: {} {}", backend, device);
                CloseStatus::NothingToClose
            }
        }
    }

    /// 关闭匹配的连接，返回被关闭的 (后端, 设备)
    pub async fn close_matching(
        &self,
        backend: Option<&str>,
        devices: Option<&[String]>,
    ) -> Vec<(String, String)> {
        let removed: Vec<((String, String), Arc<ConnectionSlot>)> = {
            let mut slots = self.slots.write().await;
            let keys: Vec<(String, String)> = slots
                .keys()
                .filter(|(b, d)| {
                    backend.map_or(true, |wanted| wanted == b)
                        && devices.map_or(true, |list| list.iter().any(|n| n == d))
                })
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| slots.remove(&key).map(|slot| (key, slot)))
                .collect()
        };

        for (_, slot) in &removed {
            close_slot(slot).await;
        }
        removed.into_iter().map(|(key, _)| key).collect()
    }

    pub async fn close_all(&self) -> usize {
        self.close_matching(None, None).await.len()
    }

    pub async fn list(&self, backend: Option<&str>) -> Vec<ConnectionInfo> {
        let slots = self.slots.read().await;
        let mut infos: Vec<ConnectionInfo> = slots
            .values()
            .filter(|slot| backend.map_or(true, |b| b == slot.backend()))
            .map(|slot| slot.info())
            .collect();
        infos.sort_by(|a, b| (&a.backend, &a.device).cmp(&(&b.backend, &b.device)));
        infos
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 立即执行一次空闲清理
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        sweep(&self.slots, idle_timeout).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

async fn sweep(slots: &RwLock<SlotMap>, idle_timeout: Duration) -> usize {
    let expired: Vec<Arc<ConnectionSlot>> = {
        let mut slots = slots.write().await;
        let keys: Vec<(String, String)> = slots
            .iter()
            .filter(|(_, slot)| !slot.in_use() && slot.idle_for() >= idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| slots.remove(key)).collect()
    };

    for slot in &expired {
        debug!("关闭空闲连接: {} {}", slot.backend(), slot.device());
        close_slot(slot).await;
    }
    expired.len()
}

async fn close_slot(slot: &ConnectionSlot) {
    if let Err(e) = slot.close().await {
        warn!("关闭连接 {} {} 失败: {}", slot.backend(), slot.device(), e);
    }
    counter!("fleetd_connections_closed_total", "backend" => slot.backend().to_string())
        .increment(1);
}

#[cfg(test)]
mod tests;
