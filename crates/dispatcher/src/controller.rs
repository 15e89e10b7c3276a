//! Controller：持有N个Worker，负责作业分派、广播、重启与统计汇总

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use fleetd_core::config::EngineConfig;
use fleetd_core::models::{
    AggregateStats, JobEvent, JobOutcome, JobRequest, JobResult, SubmitResponse, Targeting,
    WorkerStats,
};
use fleetd_core::traits::{InventoryProvider, Renderer, SubstitutionRenderer};
use fleetd_core::{EngineError, EngineResult, HostFilter};
use fleetd_infrastructure::{memory_probe_for, EventBus, MemoryProbe, ResultsQueue};
use fleetd_worker::{
    spawn_worker, BackendRegistry, ConnectionInfo, FunctionRegistry, QueuedJob, WorkerDeps,
    WorkerHandle, WorkerQueue,
};
use futures::future::join_all;
use metrics::counter;
use serde_json::json;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::strategies::{FirstIdleStrategy, WorkerCandidate, WorkerSelectionStrategy};
use crate::watchdog::{Watchdog, WatchdogAction, WatchdogStats};

/// 构造Controller所需的外部协作方
pub struct ControllerDeps {
    pub provider: Arc<dyn InventoryProvider>,
    pub backends: Arc<BackendRegistry>,
    pub functions: Arc<FunctionRegistry>,
    pub renderer: Arc<dyn Renderer>,
    /// 为 `None` 时按 `watchdog.memory_probe` 配置选择
    pub memory_probe: Option<Arc<dyn MemoryProbe>>,
    pub strategy: Box<dyn WorkerSelectionStrategy>,
}

impl ControllerDeps {
    /// 内置后端、内置函数、占位符渲染和配置指定的内存探测
    pub fn new(provider: Arc<dyn InventoryProvider>) -> Self {
        Self {
            provider,
            backends: Arc::new(BackendRegistry::with_defaults()),
            functions: Arc::new(FunctionRegistry::with_builtins()),
            renderer: Arc::new(SubstitutionRenderer::new()),
            memory_probe: None,
            strategy: Box::new(FirstIdleStrategy::new()),
        }
    }

    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = Arc::new(backends);
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = Arc::new(functions);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    pub fn with_strategy(mut self, strategy: Box<dyn WorkerSelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }
}

/// 一个Worker位置：队列在重启前后保持不变
struct WorkerSlot {
    index: usize,
    queue: Arc<WorkerQueue>,
    handle: Mutex<Option<WorkerHandle>>,
    restarting: AtomicBool,
}

impl WorkerSlot {
    fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }
}

/// Watchdog读取的Worker状态
#[derive(Debug, Clone)]
pub(crate) struct SlotSnapshot {
    pub index: usize,
    /// 没有运行中的Worker（上次重启失败）时为 `None`
    pub stats: Option<WorkerStats>,
    pub idle: bool,
    pub finished: bool,
}

pub struct Controller {
    config: Arc<EngineConfig>,
    deps: WorkerDeps,
    slots: Vec<WorkerSlot>,
    strategy: Box<dyn WorkerSelectionStrategy>,
    /// 选择Worker与入队在同一把锁下完成
    dispatch_lock: Mutex<()>,
    watchdog: Watchdog,
    shutdown_tx: broadcast::Sender<()>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// 启动全部Worker、Watchdog以及库存变更监听
    ///
    /// 任意Worker初次加载库存失败时返回错误，已启动的Worker随之释放。
    pub async fn start(config: EngineConfig, deps: ControllerDeps) -> EngineResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| EngineError::Configuration(format!("{e:#}")))?;
        let config = Arc::new(config);
        let workers = config.engine.workers;
        info!(
            "启动Controller: {} 个Worker，分派策略 {}",
            workers,
            deps.strategy.name()
        );

        let worker_deps = WorkerDeps {
            provider: deps.provider,
            backends: deps.backends,
            functions: deps.functions,
            renderer: deps.renderer,
            events: Arc::new(EventBus::new()),
            results: Arc::new(ResultsQueue::new()),
        };

        let mut slots = Vec::with_capacity(workers);
        for index in 0..workers {
            let queue = Arc::new(WorkerQueue::new());
            let handle = spawn_worker(
                index,
                Arc::clone(&config),
                worker_deps.clone(),
                Arc::clone(&queue),
            )
            .await?;
            slots.push(WorkerSlot {
                index,
                queue,
                handle: Mutex::new(Some(handle)),
                restarting: AtomicBool::new(false),
            });
        }

        let memory_probe = deps
            .memory_probe
            .unwrap_or_else(|| memory_probe_for(config.watchdog.memory_probe));
        let (shutdown_tx, _) = broadcast::channel(1);
        let controller = Arc::new(Self {
            watchdog: Watchdog::new(config.watchdog.clone(), memory_probe),
            config,
            deps: worker_deps,
            slots,
            strategy: deps.strategy,
            dispatch_lock: Mutex::new(()),
            shutdown_tx,
            background: StdMutex::new(Vec::new()),
        });

        let watchdog_task = tokio::spawn(Watchdog::run(
            Arc::downgrade(&controller),
            controller.config.watchdog.interval(),
            controller.shutdown_tx.subscribe(),
        ));
        let inventory_task = tokio::spawn(watch_inventory(
            Arc::downgrade(&controller),
            controller.deps.provider.subscribe(),
            controller.shutdown_tx.subscribe(),
        ));
        controller
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([watchdog_task, inventory_task]);

        info!("Controller启动完成");
        Ok(controller)
    }

    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn slot(&self, index: usize) -> EngineResult<&WorkerSlot> {
        self.slots.get(index).ok_or(EngineError::WorkerNotFound {
            index,
            workers: self.slots.len(),
        })
    }

    /// 提交作业并等待结果
    ///
    /// 等待超过 `job_wait_timeout` 时返回 `Timeout`，Worker中的作业继续执行，
    /// 结果仍会写入结果队列。
    pub async fn submit(&self, request: JobRequest) -> EngineResult<SubmitResponse> {
        let job_id = request.job_id;
        match request.targeting {
            Targeting::Worker(index) => {
                let slot = self.slot(index)?;
                count_submitted(&request);
                let (job, rx) = QueuedJob::new(request);
                slot.queue.push(job).await;
                debug!("作业 {} 排入Worker {} 队列", job_id, index);
                Ok(SubmitResponse::Single(self.wait(job_id, index, rx).await))
            }
            Targeting::Any => {
                count_submitted(&request);
                let (index, rx) = self.dispatch_any(request).await;
                Ok(SubmitResponse::Single(self.wait(job_id, index, rx).await))
            }
            Targeting::All => {
                let waits = self.slots.iter().map(|slot| {
                    let request = request.clone();
                    async move {
                        count_submitted(&request);
                        let (job, rx) = QueuedJob::new(request);
                        slot.queue.push(job).await;
                        (slot.index, self.wait(job_id, slot.index, rx).await)
                    }
                });
                let outcomes: BTreeMap<usize, JobOutcome> =
                    join_all(waits).await.into_iter().collect();
                Ok(SubmitResponse::Broadcast(outcomes))
            }
        }
    }

    /// 为作业选择Worker并入队
    async fn dispatch_any(&self, request: JobRequest) -> (usize, oneshot::Receiver<JobResult>) {
        let (job, rx) = QueuedJob::new(request);
        let index = self.dispatch(job).await;
        (index, rx)
    }

    async fn dispatch(&self, job: QueuedJob) -> usize {
        let _guard = self.dispatch_lock.lock().await;
        let index = self.select_worker().await;
        debug!("作业 {} 分派到Worker {}", job.request.job_id, index);
        self.slots[index].queue.push(job).await;
        index
    }

    async fn select_worker(&self) -> usize {
        let mut candidates = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            candidates.push(WorkerCandidate::new(
                slot.index,
                slot.queue.load().await,
                !slot.is_restarting(),
            ));
        }
        self.strategy.select_worker(&candidates).unwrap_or(0)
    }

    async fn wait(
        &self,
        job_id: Uuid,
        worker: usize,
        rx: oneshot::Receiver<JobResult>,
    ) -> JobOutcome {
        let waited = self.config.engine.job_wait_timeout();
        match tokio::time::timeout(waited, rx).await {
            Ok(Ok(result)) => JobOutcome::Completed(result),
            Ok(Err(_)) => {
                warn!("{}", EngineError::WorkerUnavailable { index: worker });
                JobOutcome::Unavailable { job_id, worker }
            }
            Err(_) => {
                warn!("{}，作业仍在Worker {} 中执行", EngineError::Timeout { job_id, waited }, worker);
                JobOutcome::Timeout { job_id, worker }
            }
        }
    }

    /// 以管理作业的形式发送到指定Worker或全部Worker
    async fn submit_admin(
        &self,
        request: JobRequest,
        worker: Option<usize>,
    ) -> EngineResult<BTreeMap<usize, JobOutcome>> {
        let targeting = match worker {
            Some(index) => Targeting::Worker(index),
            None => Targeting::All,
        };
        match self.submit(request.with_targeting(targeting)).await? {
            SubmitResponse::Single(outcome) => {
                Ok(BTreeMap::from([(worker.unwrap_or_default(), outcome)]))
            }
            SubmitResponse::Broadcast(outcomes) => Ok(outcomes),
        }
    }

    /// 各Worker当前打开的连接
    pub async fn connections(
        &self,
        worker: Option<usize>,
    ) -> EngineResult<BTreeMap<usize, Vec<ConnectionInfo>>> {
        let outcomes = self
            .submit_admin(JobRequest::new("connections"), worker)
            .await?;
        let mut connections = BTreeMap::new();
        for (index, outcome) in outcomes {
            let payload = admin_payload(index, outcome, self.config.engine.job_wait_timeout())?;
            let list: Vec<ConnectionInfo> =
                serde_json::from_value(payload["connections"].clone())?;
            connections.insert(index, list);
        }
        Ok(connections)
    }

    /// 关闭连接，可按Worker、后端和设备过滤
    pub async fn disconnect(
        &self,
        worker: Option<usize>,
        backend: Option<&str>,
        filter: HostFilter,
    ) -> EngineResult<BTreeMap<usize, JobOutcome>> {
        let mut request = JobRequest::new("disconnect").with_filter(filter);
        if let Some(backend) = backend {
            request = request.with_param("backend", json!(backend));
        }
        self.submit_admin(request, worker).await
    }

    /// 所有Worker重新加载库存，并丢弃全部连接和缓存
    pub async fn refresh(&self) -> EngineResult<BTreeMap<usize, JobOutcome>> {
        info!("刷新所有Worker的库存");
        self.submit_admin(JobRequest::new("refresh"), None).await
    }

    /// 各Worker的统计，队列长度取自Controller持有的队列
    pub async fn worker_stats(&self) -> Vec<WorkerStats> {
        let mut all = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let mut stats = match slot.handle.lock().await.as_ref() {
                Some(handle) => handle.stats(),
                None => WorkerStats::new(slot.index),
            };
            stats.queue_depth = slot.queue.len().await;
            all.push(stats);
        }
        all
    }

    pub async fn stats(&self) -> AggregateStats {
        AggregateStats::from_workers(&self.worker_stats().await)
    }

    /// 取出结果队列中的全部结果
    pub async fn drain_results_queue(&self) -> Vec<JobResult> {
        self.deps.results.drain().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.deps.events.subscribe()
    }

    pub(crate) fn publish_event(&self, event: JobEvent) {
        self.deps.events.publish(event);
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn watchdog_stats(&self) -> WatchdogStats {
        self.watchdog.stats()
    }

    /// 执行一次Watchdog检查
    pub async fn watchdog_tick(&self) -> Vec<WatchdogAction> {
        self.watchdog.tick(self).await
    }

    pub(crate) async fn snapshots(&self) -> Vec<SlotSnapshot> {
        let mut snapshots = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let handle = slot.handle.lock().await;
            snapshots.push(SlotSnapshot {
                index: slot.index,
                stats: handle.as_ref().map(WorkerHandle::stats),
                idle: slot.queue.load().await.is_idle(),
                finished: handle.as_ref().is_some_and(WorkerHandle::is_finished),
            });
        }
        snapshots
    }

    /// 重启Worker
    ///
    /// 重启期间Worker不接收 `Any` 作业，队列中的 `Any` 作业转给其他Worker；
    /// 指定该Worker或广播的作业留在队列中由新Worker执行。新Worker加载库存
    /// 失败时保持重启状态，由下一次Watchdog检查重试。
    pub async fn restart_worker(&self, index: usize) -> EngineResult<()> {
        let slot = self.slot(index)?;
        slot.restarting.store(true, Ordering::SeqCst);
        let mut handle = slot.handle.lock().await;

        if let Some(old) = handle.take() {
            info!("终止Worker {}", index);
            old.shutdown().await;
        }
        counter!("fleetd_watchdog_restarts_total", "worker" => index.to_string()).increment(1);
        self.redirect_queued(slot).await;

        match spawn_worker(
            index,
            Arc::clone(&self.config),
            self.deps.clone(),
            Arc::clone(&slot.queue),
        )
        .await
        {
            Ok(new) => {
                *handle = Some(new);
                slot.restarting.store(false, Ordering::SeqCst);
                info!("Worker {} 重启完成", index);
                Ok(())
            }
            Err(e) => {
                error!("Worker {} 重启失败，等待下次检查重试: {}", index, e);
                Err(e)
            }
        }
    }

    async fn redirect_queued(&self, slot: &WorkerSlot) {
        if self.slots.len() < 2 {
            return;
        }
        let jobs = slot.queue.take_redirectable().await;
        if jobs.is_empty() {
            return;
        }
        info!("Worker {} 重启，转移 {} 个排队作业", slot.index, jobs.len());
        for job in jobs {
            self.dispatch(job).await;
        }
    }

    /// 停止后台任务并终止所有Worker
    pub async fn shutdown(&self) {
        info!("关闭Controller");
        let _ = self.shutdown_tx.send(());
        let background: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in background {
            task.abort();
        }
        for slot in &self.slots {
            slot.restarting.store(true, Ordering::SeqCst);
            if let Some(handle) = slot.handle.lock().await.take() {
                handle.shutdown().await;
            }
        }
        info!("所有Worker已停止");
    }
}

fn count_submitted(request: &JobRequest) {
    counter!("fleetd_jobs_submitted_total", "function" => request.function.clone()).increment(1);
}

/// 管理作业的结果负载
fn admin_payload(
    index: usize,
    outcome: JobOutcome,
    waited: Duration,
) -> EngineResult<serde_json::Value> {
    match outcome {
        JobOutcome::Completed(result) => match (result.payload, result.error) {
            (Some(payload), _) => Ok(payload),
            (None, Some(error)) => Err(EngineError::Internal(error.message)),
            (None, None) => Ok(serde_json::Value::Null),
        },
        JobOutcome::Timeout { job_id, .. } => Err(EngineError::Timeout { job_id, waited }),
        JobOutcome::Unavailable { .. } => Err(EngineError::WorkerUnavailable { index }),
    }
}

/// 库存变化时刷新所有Worker
async fn watch_inventory(
    controller: Weak<Controller>,
    mut changes: broadcast::Receiver<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            change = changes.recv() => {
                if let Err(broadcast::error::RecvError::Closed) = change {
                    debug!("库存来源已关闭，停止监听");
                    break;
                }
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                info!("库存发生变化");
                if let Err(e) = controller.refresh().await {
                    error!("库存刷新失败: {}", e);
                }
            }
            _ = shutdown.recv() => {
                debug!("停止库存监听");
                break;
            }
        }
    }
}
