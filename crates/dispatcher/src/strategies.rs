//! 作业分派策略：为 `Targeting::Any` 的作业选择Worker

use fleetd_worker::QueueLoad;
use tracing::debug;

/// 参与选择的Worker快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCandidate {
    pub index: usize,
    pub load: QueueLoad,
    /// 重启中的Worker不接收新作业
    pub available: bool,
}

impl WorkerCandidate {
    pub fn new(index: usize, load: QueueLoad, available: bool) -> Self {
        Self {
            index,
            load,
            available,
        }
    }
}

pub trait WorkerSelectionStrategy: Send + Sync {
    /// 返回选中的Worker索引，没有候选时返回 `None`
    fn select_worker(&self, candidates: &[WorkerCandidate]) -> Option<usize>;

    fn name(&self) -> &str;
}

/// 可用的候选；全部不可用时退回全部候选，作业在队列中等待重启完成
fn usable(candidates: &[WorkerCandidate]) -> Vec<&WorkerCandidate> {
    let available: Vec<&WorkerCandidate> = candidates.iter().filter(|c| c.available).collect();
    if available.is_empty() {
        debug!("没有可用的Worker，作业将排入重启中的Worker队列");
        candidates.iter().collect()
    } else {
        available
    }
}

/// 队列最短的Worker，队列长度相同时取索引最小的
pub struct LeastLoadedStrategy;

impl LeastLoadedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastLoadedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSelectionStrategy for LeastLoadedStrategy {
    fn select_worker(&self, candidates: &[WorkerCandidate]) -> Option<usize> {
        let selected = usable(candidates)
            .into_iter()
            .min_by_key(|c| (c.load.depth, c.index))?;

        debug!(
            "负载策略选择Worker: {} (队列长度: {})",
            selected.index, selected.load.depth
        );
        Some(selected.index)
    }

    fn name(&self) -> &str {
        "LeastLoaded"
    }
}

/// 按索引顺序选择第一个空闲Worker，全部忙碌时退回负载策略
pub struct FirstIdleStrategy {
    fallback: LeastLoadedStrategy,
}

impl FirstIdleStrategy {
    pub fn new() -> Self {
        Self {
            fallback: LeastLoadedStrategy::new(),
        }
    }
}

impl Default for FirstIdleStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSelectionStrategy for FirstIdleStrategy {
    fn select_worker(&self, candidates: &[WorkerCandidate]) -> Option<usize> {
        let idle = candidates
            .iter()
            .filter(|c| c.available && c.load.is_idle())
            .min_by_key(|c| c.index);

        match idle {
            Some(selected) => {
                debug!("选择空闲Worker: {}", selected.index);
                Some(selected.index)
            }
            None => self.fallback.select_worker(candidates),
        }
    }

    fn name(&self) -> &str {
        "FirstIdle"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(index: usize, active: bool, depth: usize) -> WorkerCandidate {
        WorkerCandidate::new(index, QueueLoad { active, depth }, true)
    }

    #[test]
    fn test_first_idle_in_index_order() {
        let strategy = FirstIdleStrategy::new();
        let candidates = vec![
            candidate(0, true, 0),
            candidate(1, false, 0),
            candidate(2, false, 0),
        ];
        assert_eq!(strategy.select_worker(&candidates), Some(1));
    }

    #[test]
    fn test_queued_worker_is_not_idle() {
        let strategy = FirstIdleStrategy::new();
        let candidates = vec![
            candidate(0, false, 1),
            candidate(1, false, 0),
        ];
        assert_eq!(strategy.select_worker(&candidates), Some(1));
    }

    #[test]
    fn test_all_busy_falls_back_to_least_loaded() {
        let strategy = FirstIdleStrategy::new();
        let candidates = vec![
            candidate(0, true, 2),
            candidate(1, true, 1),
            candidate(2, true, 1),
        ];
        assert_eq!(strategy.select_worker(&candidates), Some(1));
    }

    #[test]
    fn test_restarting_worker_skipped() {
        let strategy = FirstIdleStrategy::new();
        let mut restarting = candidate(0, false, 0);
        restarting.available = false;
        let candidates = vec![restarting, candidate(1, true, 3)];
        assert_eq!(strategy.select_worker(&candidates), Some(1));
    }

    #[test]
    fn test_all_restarting_still_selects() {
        let strategy = LeastLoadedStrategy::new();
        let candidates = vec![
            WorkerCandidate::new(0, QueueLoad { active: false, depth: 2 }, false),
            WorkerCandidate::new(1, QueueLoad { active: false, depth: 0 }, false),
        ];
        assert_eq!(strategy.select_worker(&candidates), Some(1));
    }

    #[test]
    fn test_no_candidates() {
        assert_eq!(FirstIdleStrategy::new().select_worker(&[]), None);
        assert_eq!(FirstIdleStrategy::new().name(), "FirstIdle");
    }
}
