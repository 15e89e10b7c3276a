use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker运行统计
///
/// 由Worker自身持续更新并发布，Controller和Watchdog只读。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker: String,
    pub index: usize,
    pub busy: bool,
    /// 读取快照时由队列长度填充
    pub queue_depth: usize,
    pub worker_jobs_started: u64,
    pub worker_jobs_completed: u64,
    pub worker_jobs_failed: u64,
    pub worker_hosts_tasks_failed: u64,
    /// 按设备统计的失败任务数
    pub hosts_tasks_failed: BTreeMap<String, u64>,
    pub open_connections: usize,
    pub inventory_size: usize,
    pub memory_mbyte: f64,
    pub started_at: DateTime<Utc>,
}

impl WorkerStats {
    pub fn new(index: usize) -> Self {
        Self {
            worker: worker_name(index),
            index,
            busy: false,
            queue_depth: 0,
            worker_jobs_started: 0,
            worker_jobs_completed: 0,
            worker_jobs_failed: 0,
            worker_hosts_tasks_failed: 0,
            hosts_tasks_failed: BTreeMap::new(),
            open_connections: 0,
            inventory_size: 0,
            memory_mbyte: 0.0,
            started_at: Utc::now(),
        }
    }

    /// Worker存活时长
    pub fn age(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    pub fn record_device_failure(&mut self, device: &str) {
        self.worker_hosts_tasks_failed += 1;
        *self.hosts_tasks_failed.entry(device.to_string()).or_insert(0) += 1;
    }
}

/// Worker名称
pub fn worker_name(index: usize) -> String {
    format!("fleetd-worker-{index}")
}

/// 所有Worker的汇总统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub workers: usize,
    pub busy_workers: usize,
    pub queued_jobs: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub hosts_tasks_failed: u64,
    pub open_connections: usize,
}

impl AggregateStats {
    pub fn from_workers<'a>(stats: impl IntoIterator<Item = &'a WorkerStats>) -> Self {
        stats.into_iter().fold(Self::default(), |mut acc, s| {
            acc.workers += 1;
            acc.busy_workers += usize::from(s.busy);
            acc.queued_jobs += s.queue_depth;
            acc.jobs_completed += s.worker_jobs_completed;
            acc.jobs_failed += s.worker_jobs_failed;
            acc.hosts_tasks_failed += s.worker_hosts_tasks_failed;
            acc.open_connections += s.open_connections;
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_device_failure() {
        let mut stats = WorkerStats::new(0);
        stats.record_device_failure("r1");
        stats.record_device_failure("r1");
        stats.record_device_failure("r2");
        assert_eq!(stats.worker_hosts_tasks_failed, 3);
        assert_eq!(stats.hosts_tasks_failed["r1"], 2);
        assert_eq!(stats.worker, "fleetd-worker-0");
    }

    #[test]
    fn test_aggregate_stats() {
        let mut a = WorkerStats::new(0);
        a.busy = true;
        a.worker_jobs_completed = 2;
        a.open_connections = 3;
        let mut b = WorkerStats::new(1);
        b.queue_depth = 4;
        b.worker_jobs_failed = 1;

        let total = AggregateStats::from_workers([&a, &b]);
        assert_eq!(total.workers, 2);
        assert_eq!(total.busy_workers, 1);
        assert_eq!(total.queued_jobs, 4);
        assert_eq!(total.jobs_completed, 2);
        assert_eq!(total.jobs_failed, 1);
        assert_eq!(total.open_connections, 3);
    }
}
