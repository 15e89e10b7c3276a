//! Worker执行体
//!
//! 每个Worker是一个独立的tokio任务，独占自己的库存副本、连接管理器、
//! 内存缓存和文件存储。Worker从队列中逐个取出作业执行，同一时刻只执行
//! 一个作业；作业内的设备单元按 `max_concurrency` 并发执行。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetd_core::config::EngineConfig;
use fleetd_core::models::{
    CredentialProfile, Device, DeviceResult, ErrorDetail, EventStatus, Inventory, JobEvent,
    JobRequest, JobResult, JobStatus, ReconnectEntry, WorkerStats,
};
use fleetd_core::traits::{InventoryProvider, Renderer};
use fleetd_core::{EngineError, EngineResult, ErrorKind};
use fleetd_infrastructure::{
    estimate_footprint_mbyte, ArtifactStore, CacheScope, CacheStore, EventBus, ResultsQueue,
};
use futures::stream::{self, StreamExt};
use metrics::counter;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::backends::BackendRegistry;
use crate::connection::{ConnectionLease, ConnectionManager, OpenRequest};
use crate::functions::{DeviceTask, FunctionHandler, FunctionRegistry, StepEmitter, TaskContext};
use crate::queue::{QueuedJob, WorkerQueue};
use crate::retry::{Backoff, RetryController, RetryPolicy};

/// 统计刷新间隔（空闲时刷新连接数和内存估算）
const STATS_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Worker依赖的共享组件，重启时原样交给新的Worker
#[derive(Clone)]
pub struct WorkerDeps {
    pub provider: Arc<dyn InventoryProvider>,
    pub backends: Arc<BackendRegistry>,
    pub functions: Arc<FunctionRegistry>,
    pub renderer: Arc<dyn Renderer>,
    pub events: Arc<EventBus>,
    pub results: Arc<ResultsQueue>,
}

/// Worker独占的状态
pub struct WorkerState {
    pub inventory: Inventory,
    /// 展开继承关系后的设备
    pub devices: BTreeMap<String, Device>,
    pub connections: ConnectionManager,
    pub cache: CacheStore,
    pub artifacts: ArtifactStore,
}

impl WorkerState {
    fn set_inventory(&mut self, inventory: Inventory) {
        self.devices = inventory.resolve();
        self.inventory = inventory;
    }

    /// 重新加载库存，并丢弃全部连接和缓存
    pub async fn refresh(
        &mut self,
        provider: &dyn InventoryProvider,
    ) -> EngineResult<RefreshSummary> {
        let inventory = provider.load().await?;
        self.set_inventory(inventory);
        let closed_connections = self.connections.close_all().await;
        let cleared_cache_entries = self.cache.clear_all();
        Ok(RefreshSummary {
            inventory_size: self.devices.len(),
            closed_connections,
            cleared_cache_entries,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RefreshSummary {
    pub inventory_size: usize,
    pub closed_connections: usize,
    pub cleared_cache_entries: usize,
}

/// 运行中的Worker
pub struct WorkerHandle {
    index: usize,
    task: JoinHandle<()>,
    stats: watch::Receiver<WorkerStats>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// 最近一次发布的统计
    pub fn stats(&self) -> WorkerStats {
        self.stats.borrow().clone()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<WorkerStats> {
        self.stats.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 终止Worker任务，其拥有的连接、缓存随之释放
    pub fn abort(&self) {
        self.task.abort();
    }

    /// 终止Worker任务并等待其退出
    pub async fn shutdown(mut self) {
        self.task.abort();
        if let Err(e) = (&mut self.task).await {
            if e.is_panic() {
                warn!("Worker {} 曾发生panic: {}", self.index, e);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 加载库存、打开文件存储并启动Worker任务
///
/// 库存加载失败时返回错误，不启动任务。
pub async fn spawn_worker(
    index: usize,
    config: Arc<EngineConfig>,
    deps: WorkerDeps,
    queue: Arc<WorkerQueue>,
) -> EngineResult<WorkerHandle> {
    let inventory = deps.provider.load().await?;
    let artifacts = ArtifactStore::open(
        config.artifacts.base_dir.join(format!("worker-{index}")),
        config.artifacts.files_max_count,
    )
    .await?;

    let mut connections = ConnectionManager::new(index, Arc::clone(&deps.backends));
    if let Some(idle_timeout) = config.connections.idle_timeout() {
        connections.start_idle_sweeper(idle_timeout);
    }

    let mut state = WorkerState {
        inventory: Inventory::default(),
        devices: BTreeMap::new(),
        connections,
        cache: CacheStore::new(),
        artifacts,
    };
    state.set_inventory(inventory);

    let mut stats = WorkerStats::new(index);
    stats.inventory_size = state.devices.len();
    stats.memory_mbyte = estimate_footprint_mbyte(stats.inventory_size, 0, 0);
    let (stats_tx, stats_rx) = watch::channel(stats.clone());

    // 上一个Worker可能在执行中被终止
    queue.finish().await;

    let worker = Worker {
        index,
        config,
        deps,
        queue,
        state,
        stats,
        stats_tx,
    };
    info!(
        "Worker {} 启动，库存 {} 台设备",
        index, worker.stats.inventory_size
    );
    let task = tokio::spawn(worker.run());

    Ok(WorkerHandle {
        index,
        task,
        stats: stats_rx,
    })
}

/// 单个设备单元共享的执行计划
struct UnitPlan<'a> {
    request: &'a JobRequest,
    task: &'a dyn DeviceTask,
    backend: &'a str,
    reconnect: &'a [CredentialProfile],
    connect: RetryPolicy,
    task_retry: RetryPolicy,
}

pub(crate) struct Worker {
    index: usize,
    config: Arc<EngineConfig>,
    deps: WorkerDeps,
    queue: Arc<WorkerQueue>,
    state: WorkerState,
    stats: WorkerStats,
    stats_tx: watch::Sender<WorkerStats>,
}

impl Worker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(STATS_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                job = self.queue.pop() => self.process(job).await,
                _ = ticker.tick() => self.refresh_stats().await,
            }
        }
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.stats.clone());
    }

    async fn refresh_stats(&mut self) {
        self.stats.open_connections = self.state.connections.len().await;
        self.stats.inventory_size = self.state.devices.len();
        self.stats.memory_mbyte = estimate_footprint_mbyte(
            self.stats.inventory_size,
            self.stats.open_connections,
            self.state.cache.approximate_bytes(),
        );
        self.publish_stats();
    }

    #[instrument(
        skip_all,
        fields(worker = self.index, job_id = %job.request.job_id, function = %job.request.function)
    )]
    async fn process(&mut self, job: QueuedJob) {
        let QueuedJob {
            request,
            reply,
            enqueued_at,
        } = job;
        debug!("作业排队 {:?} 后开始执行", enqueued_at.elapsed());

        self.stats.busy = true;
        self.stats.worker_jobs_started += 1;
        self.publish_stats();
        self.deps.events.publish(JobEvent::job(
            request.job_id,
            self.index,
            &request.function,
            EventStatus::Started,
        ));

        let result = self.execute(&request).await;

        let status = if result.is_failed() {
            EventStatus::Failed
        } else {
            EventStatus::Completed
        };
        let mut event = JobEvent::job(request.job_id, self.index, &request.function, status);
        if let Some(error) = &result.error {
            event = event.with_message(error.message.clone());
        }
        self.deps.events.publish(event);
        self.deps.results.push(result.clone()).await;

        if result.is_failed() {
            self.stats.worker_jobs_failed += 1;
            counter!("fleetd_jobs_failed_total", "function" => request.function.clone())
                .increment(1);
        } else {
            self.stats.worker_jobs_completed += 1;
            counter!("fleetd_jobs_completed_total", "function" => request.function.clone())
                .increment(1);
        }
        for device in result.failed_devices() {
            self.stats.record_device_failure(device);
        }
        self.stats.busy = false;
        self.refresh_stats().await;
        self.queue.finish().await;

        info!(
            "作业完成: 状态 {:?}，设备 {} 台，失败 {} 台",
            result.status,
            result.devices.len(),
            result.failed_devices().len()
        );
        if let Some(reply) = reply {
            if reply.send(result).is_err() {
                debug!("调用方已停止等待，结果只写入结果队列");
            }
        }
    }

    /// 执行作业，作业级错误转换为失败结果
    async fn execute(&mut self, request: &JobRequest) -> JobResult {
        let started_at = Utc::now();
        let outcome = match self.deps.functions.get(&request.function) {
            None => Err(EngineError::UnknownFunction {
                name: request.function.clone(),
            }),
            Some(FunctionHandler::Admin(op)) => {
                let provider = Arc::clone(&self.deps.provider);
                op.execute(request, &mut self.state, &self.stats, provider.as_ref())
                    .await
                    .map(|payload| (BTreeMap::new(), Some(payload)))
            }
            Some(FunctionHandler::Device(task)) => self
                .run_device_task(task.as_ref(), request)
                .await
                .map(|devices| (devices, None)),
        };

        let (status, devices, payload, error) = match outcome {
            Ok((devices, payload)) => (JobStatus::Completed, devices, payload, None),
            Err(e) => {
                warn!("作业失败: {}", e);
                (JobStatus::Failed, BTreeMap::new(), None, Some(ErrorDetail::from(&e)))
            }
        };

        JobResult {
            job_id: request.job_id,
            function: request.function.clone(),
            worker: self.index,
            status,
            devices,
            payload,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn reconnect_chain(&self, request: &JobRequest) -> EngineResult<Vec<CredentialProfile>> {
        request
            .retry
            .reconnect
            .iter()
            .map(|entry| match entry {
                ReconnectEntry::Named(name) => self
                    .state
                    .inventory
                    .credential(name)
                    .cloned()
                    .ok_or_else(|| EngineError::InvalidParameters(format!("未知的凭据配置: {name}"))),
                ReconnectEntry::Inline(profile) => Ok(profile.clone()),
            })
            .collect()
    }

    /// 对匹配的设备并发执行任务
    async fn run_device_task(
        &mut self,
        task: &dyn DeviceTask,
        request: &JobRequest,
    ) -> EngineResult<BTreeMap<String, DeviceResult>> {
        if request.filter.is_empty() && self.config.engine.filter_required {
            return Err(EngineError::FilterRequired);
        }
        let names = request.filter.resolve(&self.state.devices)?;
        if names.is_empty() {
            debug!("过滤条件没有匹配任何设备");
        }

        let connections = &self.config.connections;
        let backoff = Backoff::from_config(connections);
        let reconnect = self.reconnect_chain(request)?;
        let backend = request
            .backend
            .clone()
            .unwrap_or_else(|| self.config.engine.default_backend.clone());
        let plan = UnitPlan {
            request,
            task,
            backend: &backend,
            reconnect: &reconnect,
            connect: RetryPolicy::new(
                request.retry.connect_retry.unwrap_or(connections.connect_retry),
                backoff.clone(),
            ),
            task_retry: RetryPolicy::new(
                request.retry.task_retry.unwrap_or(connections.task_retry),
                backoff,
            ),
        };
        let timeout = request.timeout().unwrap_or_else(|| self.config.engine.job_timeout());

        let mut results = self.fan_out(&names, &plan, timeout).await;

        for name in &names {
            if !results.contains_key(name) {
                let err = EngineError::Timeout {
                    job_id: request.job_id,
                    waited: timeout,
                };
                self.device_event(request, name, EventStatus::Failed, Some(err.to_string()));
                counter!("fleetd_device_tasks_failed_total", "function" => request.function.clone())
                    .increment(1);
                results.insert(name.clone(), DeviceResult::failure(name.as_str(), &err));
            }
        }

        self.apply_cache_directives(request, &results);
        self.apply_artifacts(request, &mut results).await;
        Ok(results)
    }

    /// 并发执行设备单元，超时后未完成的单元被丢弃
    async fn fan_out(
        &self,
        names: &[String],
        plan: &UnitPlan<'_>,
        timeout: Duration,
    ) -> BTreeMap<String, DeviceResult> {
        let units: Vec<_> = names
            .iter()
            .filter_map(|name| self.state.devices.get(name))
            .map(|device| self.run_unit(device, plan))
            .collect();
        let mut pending =
            stream::iter(units).buffer_unordered(self.config.engine.max_concurrency.max(1));

        let mut results = BTreeMap::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some(result) => {
                        results.insert(result.device.clone(), result);
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        "设备操作超时（{:?}），{} 台设备未完成",
                        timeout,
                        names.len() - results.len()
                    );
                    break;
                }
            }
        }
        results
    }

    fn device_event(
        &self,
        request: &JobRequest,
        device: &str,
        status: EventStatus,
        message: Option<String>,
    ) {
        let mut event = JobEvent::device(request.job_id, self.index, device, status);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.deps.events.publish(event);
    }

    async fn open_connection(
        &self,
        device: &Device,
        plan: &UnitPlan<'_>,
    ) -> EngineResult<ConnectionLease> {
        self.state
            .connections
            .open(OpenRequest {
                device,
                backend: plan.backend,
                via: plan.request.via.as_deref(),
                force_reopen: plan.request.force_reopen,
                connect: &plan.connect,
                reconnect: plan.reconnect,
            })
            .await
    }

    /// 单台设备：获取连接、带重试执行任务、记录结果
    async fn run_unit(&self, device: &Device, plan: &UnitPlan<'_>) -> DeviceResult {
        let request = plan.request;
        self.device_event(request, &device.name, EventStatus::Started, None);

        let lease = if plan.task.needs_connection(request) {
            match self.open_connection(device, plan).await {
                Ok(lease) => Some(lease),
                Err(e) => {
                    let mut result = DeviceResult::failure(device.name.as_str(), &e);
                    if let EngineError::ConnectFailed { attempts, .. } = &e {
                        result.connect_attempts = *attempts;
                    }
                    return self.unit_failed(request, result);
                }
            }
        } else {
            None
        };

        let cache = self.state.cache.device_view(&device.name);
        let steps = StepEmitter::new(
            Arc::clone(&self.deps.events),
            request.job_id,
            self.index,
            &device.name,
        );
        let ctx = TaskContext {
            request,
            device,
            lease: lease.as_ref(),
            renderer: self.deps.renderer.as_ref(),
            cache: &cache,
            steps: &steps,
        };
        let ctx = &ctx;

        let outcome = RetryController::with_retry(
            &plan.task_retry,
            move |attempt| {
                if attempt > 0 {
                    debug!("设备 {} 第 {} 次重试任务", device.name, attempt);
                }
                plan.task.run(ctx)
            },
            |err, attempts| {
                warn!("设备 {} 任务执行 {} 次均失败: {}", device.name, attempts, err);
            },
        )
        .await;
        let task_retries = outcome.retries();

        let mut result = match outcome.result {
            Ok(output) if output.failed => DeviceResult {
                failed: true,
                error: Some(ErrorDetail {
                    kind: ErrorKind::CheckFailed,
                    message: output.message.unwrap_or_default(),
                }),
                ..DeviceResult::success(device.name.as_str(), output.result)
            },
            Ok(output) => DeviceResult::success(device.name.as_str(), output.result),
            Err(e) => DeviceResult::failure(device.name.as_str(), &e),
        };
        result.task_retries = task_retries;
        if let Some(lease) = &lease {
            result.connect_attempts = lease.connect_attempts();
            result.profile_index = lease.profile_index();
        }

        if result.failed {
            self.unit_failed(request, result)
        } else {
            self.device_event(request, &device.name, EventStatus::Completed, None);
            result
        }
    }

    fn unit_failed(&self, request: &JobRequest, result: DeviceResult) -> DeviceResult {
        let message = result.error.as_ref().map(|e| e.message.clone());
        warn!(
            "设备 {} 执行失败: {}",
            result.device,
            message.as_deref().unwrap_or_default()
        );
        self.device_event(request, &result.device, EventStatus::Failed, message);
        counter!("fleetd_device_tasks_failed_total", "function" => request.function.clone())
            .increment(1);
        result
    }

    /// 将成功设备的结果写入缓存
    fn apply_cache_directives(
        &mut self,
        request: &JobRequest,
        results: &BTreeMap<String, DeviceResult>,
    ) {
        for directive in &request.cache {
            for result in results.values().filter(|r| !r.failed) {
                let value = match &directive.select {
                    Some(pointer) => match result.result.pointer(pointer) {
                        Some(value) => value.clone(),
                        None => {
                            debug!("设备 {} 的结果中没有 {}", result.device, pointer);
                            continue;
                        }
                    },
                    None => result.result.clone(),
                };
                let scope = CacheScope::for_target(directive.target, &result.device);
                self.state
                    .cache
                    .put(&scope, &directive.key, value, directive.mode);
            }
        }
    }

    /// 处理 `diff` 和 `to_file`：先与旧版本比较，再保存新版本
    ///
    /// 比较或保存失败时该设备标记为失败并记录错误。
    async fn apply_artifacts(
        &mut self,
        request: &JobRequest,
        results: &mut BTreeMap<String, DeviceResult>,
    ) {
        if request.diff.is_none() && request.to_file.is_none() {
            return;
        }
        for result in results.values_mut().filter(|r| !r.failed) {
            let content = artifact_text(&result.result);

            if let Some(filegroup) = &request.diff {
                match self
                    .state
                    .artifacts
                    .diff_with_last(filegroup, &result.device, &content)
                    .await
                {
                    Ok(diff) => result.diff = diff,
                    Err(e) => {
                        warn!("设备 {} 比较文件组 {} 失败: {}", result.device, filegroup, e);
                        self.artifact_failed(request, result, &e);
                        continue;
                    }
                }
            }

            if let Some(filegroup) = &request.to_file {
                if let Err(e) = self
                    .state
                    .artifacts
                    .save(filegroup, &result.device, &content)
                    .await
                {
                    error!("设备 {} 保存到文件组 {} 失败: {}", result.device, filegroup, e);
                    self.artifact_failed(request, result, &e);
                }
            }
        }
    }

    fn artifact_failed(&self, request: &JobRequest, result: &mut DeviceResult, err: &EngineError) {
        result.failed = true;
        result.error = Some(ErrorDetail::from(err));
        self.device_event(request, &result.device, EventStatus::Failed, Some(err.to_string()));
        counter!("fleetd_device_tasks_failed_total", "function" => request.function.clone())
            .increment(1);
    }
}

/// 结果写入文件时的文本形式
fn artifact_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
