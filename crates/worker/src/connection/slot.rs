use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fleetd_core::traits::DeviceSession;
use fleetd_core::DriverError;
use tokio::sync::{Mutex, MutexGuard};

use super::ConnectionInfo;

/// 一个已打开的连接
pub(crate) struct ConnectionSlot {
    backend: String,
    device: String,
    session: Mutex<Box<dyn DeviceSession>>,
    in_use: AtomicUsize,
    created: Instant,
    /// 相对 `created` 的最后使用时间（毫秒）
    last_used_ms: AtomicU64,
    opened_at: DateTime<Utc>,
    profile_index: Option<usize>,
    via: Option<String>,
    connect_attempts: u32,
}

impl ConnectionSlot {
    pub(crate) fn new(
        backend: &str,
        device: &str,
        session: Box<dyn DeviceSession>,
        profile_index: Option<usize>,
        via: Option<String>,
        connect_attempts: u32,
    ) -> Self {
        Self {
            backend: backend.to_string(),
            device: device.to_string(),
            session: Mutex::new(session),
            in_use: AtomicUsize::new(0),
            created: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            opened_at: Utc::now(),
            profile_index,
            via,
            connect_attempts,
        }
    }

    pub(crate) fn backend(&self) -> &str {
        &self.backend
    }

    pub(crate) fn device(&self) -> &str {
        &self.device
    }

    pub(crate) fn via(&self) -> Option<&str> {
        self.via.as_deref()
    }

    pub(crate) fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst) > 0
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_used_ms.store(elapsed, Ordering::SeqCst);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last_used = Duration::from_millis(self.last_used_ms.load(Ordering::SeqCst));
        self.created.elapsed().saturating_sub(last_used)
    }

    /// 会话被占用时视为存活
    pub(crate) fn is_alive(&self) -> bool {
        match self.session.try_lock() {
            Ok(session) => session.is_alive(),
            Err(_) => true,
        }
    }

    pub(crate) async fn close(&self) -> Result<(), DriverError> {
        self.session.lock().await.close().await
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            backend: self.backend.clone(),
            device: self.device.clone(),
            opened_at: self.opened_at,
            idle_seconds: self.idle_for().as_secs_f64(),
            in_use: self.in_use(),
            profile_index: self.profile_index,
            via: self.via.clone(),
        }
    }
}

/// 连接租约
///
/// 存在期间连接被标记为使用中，空闲清理不会关闭它；释放时刷新最后使用时间。
pub struct ConnectionLease {
    slot: Arc<ConnectionSlot>,
    newly_opened: bool,
}

impl ConnectionLease {
    /// 调用方必须持有连接表的锁
    pub(crate) fn acquire(slot: Arc<ConnectionSlot>, newly_opened: bool) -> Self {
        slot.in_use.fetch_add(1, Ordering::SeqCst);
        slot.touch();
        Self { slot, newly_opened }
    }

    pub async fn session(&self) -> MutexGuard<'_, Box<dyn DeviceSession>> {
        self.slot.session.lock().await
    }

    pub fn backend(&self) -> &str {
        &self.slot.backend
    }

    pub fn device(&self) -> &str {
        &self.slot.device
    }

    /// 成功连接所用的重连链索引，`None` 表示主凭据
    pub fn profile_index(&self) -> Option<usize> {
        self.slot.profile_index
    }

    /// 本次打开连接的尝试次数，复用已有连接时为0
    pub fn connect_attempts(&self) -> u32 {
        if self.newly_opened {
            self.slot.connect_attempts
        } else {
            0
        }
    }

    pub fn newly_opened(&self) -> bool {
        self.newly_opened
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.slot.touch();
        self.slot.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}
