//! Watchdog：周期检查Worker的内存占用和存活时长

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetd_core::config::{MemoryAction, WatchdogConfig};
use fleetd_core::models::{JobEvent, WorkerStats};
use fleetd_infrastructure::MemoryProbe;
use metrics::gauge;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::controller::Controller;

/// Watchdog运行统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WatchdogStats {
    pub ticks: u64,
    /// 按Worker统计的成功重启次数
    pub restarts: BTreeMap<usize, u64>,
    pub memory_warnings: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

impl WatchdogStats {
    pub fn total_restarts(&self) -> u64 {
        self.restarts.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    Memory,
    Age,
    /// Worker任务已退出，或上次重启没有成功
    Unavailable,
}

/// 单次检查对某个Worker采取的动作
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogAction {
    MemoryWarning { worker: usize, memory_mbyte: f64 },
    Restarted { worker: usize, reason: RestartReason },
    RestartFailed { worker: usize, reason: RestartReason },
    /// 存活时长超限但仍有作业，等空闲后再重启
    AgeRestartDeferred { worker: usize },
}

pub struct Watchdog {
    config: WatchdogConfig,
    probe: Arc<dyn MemoryProbe>,
    stats: Mutex<WatchdogStats>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config,
            probe,
            stats: Mutex::new(WatchdogStats::default()),
        }
    }

    pub fn stats(&self) -> WatchdogStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut WatchdogStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn over_memory(&self, memory_mbyte: f64) -> bool {
        memory_mbyte >= self.config.memory_threshold_mbyte
    }

    fn over_age(&self, stats: &WorkerStats) -> bool {
        self.config
            .max_age()
            .is_some_and(|max_age| stats.age() >= max_age)
    }

    /// 检查所有Worker并执行相应动作
    pub async fn tick(&self, controller: &Controller) -> Vec<WatchdogAction> {
        let mut actions = Vec::new();

        for snapshot in controller.snapshots().await {
            let worker = snapshot.index;
            let stats = match &snapshot.stats {
                Some(stats) if !snapshot.finished => stats,
                _ => {
                    warn!("Worker {} 不可用，尝试重新启动", worker);
                    actions.push(
                        self.restart(controller, worker, RestartReason::Unavailable)
                            .await,
                    );
                    continue;
                }
            };

            let memory_mbyte = self.probe.memory_mbyte(stats);
            gauge!("fleetd_worker_memory_mbyte", "worker" => worker.to_string()).set(memory_mbyte);

            if self.over_memory(memory_mbyte) {
                match self.config.memory_threshold_action {
                    MemoryAction::Log => {
                        let message = format!(
                            "Worker {} 内存占用 {:.1}MB 超过阈值 {:.1}MB",
                            worker, memory_mbyte, self.config.memory_threshold_mbyte
                        );
                        warn!("{}", message);
                        controller.publish_event(JobEvent::warning(worker, message));
                        self.update_stats(|s| s.memory_warnings += 1);
                        actions.push(WatchdogAction::MemoryWarning {
                            worker,
                            memory_mbyte,
                        });
                    }
                    MemoryAction::Restart => {
                        warn!(
                            "Worker {} 内存占用 {:.1}MB 超过阈值，立即重启",
                            worker, memory_mbyte
                        );
                        actions.push(self.restart(controller, worker, RestartReason::Memory).await);
                        continue;
                    }
                }
            }

            if self.over_age(stats) {
                if snapshot.idle {
                    info!("Worker {} 存活时长 {:?} 超限，重启", worker, stats.age());
                    actions.push(self.restart(controller, worker, RestartReason::Age).await);
                } else {
                    debug!("Worker {} 存活时长超限，等待空闲后重启", worker);
                    actions.push(WatchdogAction::AgeRestartDeferred { worker });
                }
            }
        }

        self.update_stats(|s| {
            s.ticks += 1;
            s.last_tick = Some(Utc::now());
        });
        actions
    }

    async fn restart(
        &self,
        controller: &Controller,
        worker: usize,
        reason: RestartReason,
    ) -> WatchdogAction {
        match controller.restart_worker(worker).await {
            Ok(()) => {
                self.update_stats(|s| *s.restarts.entry(worker).or_insert(0) += 1);
                WatchdogAction::Restarted { worker, reason }
            }
            Err(_) => WatchdogAction::RestartFailed { worker, reason },
        }
    }

    /// 按固定间隔执行检查，直到收到停止信号或Controller被释放
    pub(crate) async fn run(
        controller: Weak<Controller>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("启动Watchdog，检查间隔 {:?}", period);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(controller) = controller.upgrade() else {
                        break;
                    };
                    controller.watchdog_tick().await;
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出Watchdog循环");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_infrastructure::FixedMemoryProbe;

    fn watchdog(config: WatchdogConfig) -> Watchdog {
        Watchdog::new(config, Arc::new(FixedMemoryProbe::new()))
    }

    #[test]
    fn test_memory_threshold_is_inclusive() {
        let dog = watchdog(WatchdogConfig {
            memory_threshold_mbyte: 100.0,
            ..WatchdogConfig::default()
        });
        assert!(!dog.over_memory(99.9));
        assert!(dog.over_memory(100.0));
    }

    #[test]
    fn test_age_check_disabled_with_zero() {
        let mut stats = WorkerStats::new(0);
        stats.started_at = Utc::now() - chrono::Duration::hours(48);

        let disabled = watchdog(WatchdogConfig {
            child_process_max_age_seconds: 0,
            ..WatchdogConfig::default()
        });
        assert!(!disabled.over_age(&stats));

        let enabled = watchdog(WatchdogConfig {
            child_process_max_age_seconds: 3600,
            ..WatchdogConfig::default()
        });
        assert!(enabled.over_age(&stats));
        assert!(!enabled.over_age(&WorkerStats::new(1)));
    }

    #[test]
    fn test_stats_total_restarts() {
        let dog = watchdog(WatchdogConfig::default());
        dog.update_stats(|s| {
            s.restarts.insert(0, 2);
            s.restarts.insert(2, 1);
        });
        assert_eq!(dog.stats().total_restarts(), 3);
    }
}
