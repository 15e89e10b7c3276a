//! 生命周期事件总线和结果队列

use std::collections::VecDeque;

use fleetd_core::models::{JobEvent, JobResult};
use tokio::sync::{broadcast, Mutex};
use tracing::trace;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// 生命周期事件广播
///
/// 没有订阅者时事件直接丢弃；订阅者处理过慢时会收到 `Lagged`。
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: JobEvent) {
        trace!(
            "事件: worker={} {:?} {:?} device={:?} step={:?}",
            event.worker,
            event.scope,
            event.status,
            event.device,
            event.step
        );
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// 已完成作业的结果缓冲
#[derive(Debug, Default)]
pub struct ResultsQueue {
    items: Mutex<VecDeque<JobResult>>,
}

impl ResultsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, result: JobResult) {
        self.items.lock().await.push_back(result);
    }

    /// 原子地取出全部结果
    pub async fn drain(&self) -> Vec<JobResult> {
        self.items.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetd_core::models::{EventStatus, JobStatus};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn result(function: &str) -> JobResult {
        JobResult {
            job_id: Uuid::new_v4(),
            function: function.to_string(),
            worker: 0,
            status: JobStatus::Completed,
            devices: BTreeMap::new(),
            payload: None,
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_results_queue_drain() {
        let queue = ResultsQueue::new();
        queue.push(result("cli")).await;
        queue.push(result("cfg")).await;
        assert_eq!(queue.len().await, 2);

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].function, "cli");
        assert!(queue.is_empty().await);
        assert!(queue.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_event_bus_delivers_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let job_id = Uuid::new_v4();
        bus.publish(JobEvent::step(job_id, 0, "r1", "show version", EventStatus::Started));
        bus.publish(JobEvent::step(job_id, 0, "r1", "show version", EventStatus::Completed));

        assert_eq!(rx.recv().await.unwrap().status, EventStatus::Started);
        assert_eq!(rx.recv().await.unwrap().status, EventStatus::Completed);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(JobEvent::warning(1, "memory high"));
    }
}
