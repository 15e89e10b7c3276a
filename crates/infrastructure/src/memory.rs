//! Worker内存占用探测

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fleetd_core::config::MemoryProbeKind;
use fleetd_core::models::WorkerStats;

/// 每个打开连接的估算占用（MB）
const CONNECTION_FOOTPRINT_MBYTE: f64 = 0.5;
/// 每台库存设备的估算占用（MB）
const DEVICE_FOOTPRINT_MBYTE: f64 = 0.01;
const BASE_FOOTPRINT_MBYTE: f64 = 2.0;

/// 根据Worker持有的资源估算内存占用
pub fn estimate_footprint_mbyte(
    inventory_size: usize,
    open_connections: usize,
    cache_bytes: usize,
) -> f64 {
    BASE_FOOTPRINT_MBYTE
        + inventory_size as f64 * DEVICE_FOOTPRINT_MBYTE
        + open_connections as f64 * CONNECTION_FOOTPRINT_MBYTE
        + cache_bytes as f64 / (1024.0 * 1024.0)
}

/// Watchdog使用的内存探测接口
pub trait MemoryProbe: Send + Sync {
    fn memory_mbyte(&self, stats: &WorkerStats) -> f64;
}

/// 使用Worker自身上报的估算值
#[derive(Debug, Default)]
pub struct ReportedMemoryProbe;

impl MemoryProbe for ReportedMemoryProbe {
    fn memory_mbyte(&self, stats: &WorkerStats) -> f64 {
        stats.memory_mbyte
    }
}

/// 读取整个进程的常驻内存（Linux `/proc/self/status` 的 VmRSS）
///
/// 所有Worker共享同一进程，读数相同；适合只有一个Worker的部署。
#[derive(Debug, Default)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    #[cfg(target_os = "linux")]
    fn resident_mbyte() -> Option<f64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<f64>().ok())
            .map(|kb| kb / 1024.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_mbyte() -> Option<f64> {
        None
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn memory_mbyte(&self, stats: &WorkerStats) -> f64 {
        Self::resident_mbyte().unwrap_or(stats.memory_mbyte)
    }
}

/// 按配置选择探测器
pub fn memory_probe_for(kind: MemoryProbeKind) -> Arc<dyn MemoryProbe> {
    match kind {
        MemoryProbeKind::Estimate => Arc::new(ReportedMemoryProbe),
        MemoryProbeKind::Process => Arc::new(ProcessMemoryProbe),
    }
}

/// 可手动设定读数的探测器
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    readings: Mutex<HashMap<usize, f64>>,
}

impl FixedMemoryProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, worker: usize, mbyte: f64) {
        if let Ok(mut readings) = self.readings.lock() {
            readings.insert(worker, mbyte);
        }
    }

    pub fn clear(&self, worker: usize) {
        if let Ok(mut readings) = self.readings.lock() {
            readings.remove(&worker);
        }
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn memory_mbyte(&self, stats: &WorkerStats) -> f64 {
        self.readings
            .lock()
            .ok()
            .and_then(|readings| readings.get(&stats.index).copied())
            .unwrap_or(stats.memory_mbyte)
    }
}
