//! Worker作业队列
//!
//! 队列归Controller所有，Worker重启后新的Worker继续消费同一个队列。
//! `active` 标记Worker正在执行作业，与队列深度在同一把锁下读取，
//! 供调度时判断Worker是否空闲。

use std::collections::VecDeque;
use std::time::Instant;

use fleetd_core::models::{JobRequest, JobResult, Targeting};
use tokio::sync::{oneshot, Mutex, Notify};

/// 排队中的作业
#[derive(Debug)]
pub struct QueuedJob {
    pub request: JobRequest,
    /// 调用方的等待通道，调用方超时放弃后发送会失败，直接忽略
    pub reply: Option<oneshot::Sender<JobResult>>,
    pub enqueued_at: Instant,
}

impl QueuedJob {
    pub fn new(request: JobRequest) -> (Self, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                reply: Some(tx),
                enqueued_at: Instant::now(),
            },
            rx,
        )
    }

    /// 不需要回复的作业
    pub fn detached(request: JobRequest) -> Self {
        Self {
            request,
            reply: None,
            enqueued_at: Instant::now(),
        }
    }
}

/// 队列负载快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLoad {
    pub active: bool,
    pub depth: usize,
}

impl QueueLoad {
    pub fn is_idle(&self) -> bool {
        !self.active && self.depth == 0
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: VecDeque<QueuedJob>,
    active: bool,
}

/// 单个Worker的FIFO队列
#[derive(Debug, Default)]
pub struct WorkerQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, job: QueuedJob) {
        self.state.lock().await.jobs.push_back(job);
        self.notify.notify_one();
    }

    /// 放回队首，保持原有顺序
    pub async fn push_front(&self, jobs: Vec<QueuedJob>) {
        if jobs.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for job in jobs.into_iter().rev() {
            state.jobs.push_front(job);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// 等待下一个作业，取出时将队列标记为执行中
    pub async fn pop(&self) -> QueuedJob {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(job) = state.jobs.pop_front() {
                    state.active = true;
                    return job;
                }
            }
            self.notify.notified().await;
        }
    }

    /// 当前作业执行完毕
    pub async fn finish(&self) {
        self.state.lock().await.active = false;
    }

    pub async fn load(&self) -> QueueLoad {
        let state = self.state.lock().await;
        QueueLoad {
            active: state.active,
            depth: state.jobs.len(),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 取出可以转给其他Worker的作业（目标为 `Any` 的作业）
    ///
    /// 指定了Worker的作业留在队列中，等待重启后的Worker执行。
    pub async fn take_redirectable(&self) -> Vec<QueuedJob> {
        let mut state = self.state.lock().await;
        let (redirect, keep): (VecDeque<QueuedJob>, VecDeque<QueuedJob>) = state
            .jobs
            .drain(..)
            .partition(|job| job.request.targeting == Targeting::Any);
        state.jobs = keep;
        redirect.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_and_active_flag() {
        let queue = WorkerQueue::new();
        queue.push(QueuedJob::detached(JobRequest::new("a"))).await;
        queue.push(QueuedJob::detached(JobRequest::new("b"))).await;
        assert_eq!(queue.load().await, QueueLoad { active: false, depth: 2 });

        assert_eq!(queue.pop().await.request.function, "a");
        let load = queue.load().await;
        assert!(load.active);
        assert!(!load.is_idle());

        assert_eq!(queue.pop().await.request.function, "b");
        queue.finish().await;
        assert!(queue.load().await.is_idle());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(WorkerQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.request.function })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(QueuedJob::detached(JobRequest::new("late"))).await;
        let function = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(function, "late");
    }

    #[tokio::test]
    async fn test_take_redirectable_keeps_pinned_jobs() {
        let queue = WorkerQueue::new();
        queue.push(QueuedJob::detached(JobRequest::new("any-1"))).await;
        queue
            .push(QueuedJob::detached(
                JobRequest::new("pinned").with_targeting(Targeting::Worker(1)),
            ))
            .await;
        queue.push(QueuedJob::detached(JobRequest::new("any-2"))).await;

        let moved: Vec<String> = queue
            .take_redirectable()
            .await
            .into_iter()
            .map(|job| job.request.function)
            .collect();
        assert_eq!(moved, vec!["any-1".to_string(), "any-2".to_string()]);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.pop().await.request.function, "pinned");
    }
}
