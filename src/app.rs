use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetd_core::config::{AppConfig, InventoryConfig};
use fleetd_core::models::{Inventory, JobRequest, SubmitResponse, Targeting};
use fleetd_core::traits::InventoryProvider;
use fleetd_core::HostFilter;
use fleetd_dispatcher::{Controller, ControllerDeps};
use fleetd_infrastructure::{FileInventory, StaticInventory};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// 服务模式下汇报统计的间隔
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// 主应用程序
pub struct Application {
    config: AppConfig,
    controller: Arc<Controller>,
}

impl Application {
    /// 构建库存来源并启动执行引擎
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序，Worker数量: {}", config.engine.workers);

        let provider = create_inventory(&config.inventory)?;
        let controller = Controller::start(config.engine_config(), ControllerDeps::new(provider))
            .await
            .context("启动执行引擎失败")?;

        Ok(Self { config, controller })
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// 持续运行直到收到关闭信号，期间定期汇报统计并收取结果队列
    pub async fn serve(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(
            "服务已启动，Watchdog检查间隔 {:?}",
            self.config.watchdog.interval()
        );
        let mut ticker = tokio::time::interval(STATS_REPORT_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.report().await,
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止服务");
                    break;
                }
            }
        }

        self.controller.shutdown().await;
        Ok(())
    }

    async fn report(&self) {
        let stats = self.controller.stats().await;
        let results = self.controller.drain_results_queue().await;
        let failed = results.iter().filter(|r| r.is_failed()).count();
        info!(
            "Worker {} 个（忙碌 {}），排队作业 {}，打开连接 {}；本周期完成作业 {}，失败 {}",
            stats.workers,
            stats.busy_workers,
            stats.queued_jobs,
            stats.open_connections,
            results.len(),
            failed
        );
        let watchdog = self.controller.watchdog_stats();
        if watchdog.total_restarts() > 0 {
            info!("Watchdog累计重启Worker {} 次", watchdog.total_restarts());
        }
    }

    /// 提交单个作业并等待结果
    pub async fn run_job(&self, request: JobRequest) -> Result<SubmitResponse> {
        let function = request.function.clone();
        self.controller
            .submit(request)
            .await
            .with_context(|| format!("执行作业 {function} 失败"))
    }

    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
    }
}

fn create_inventory(config: &InventoryConfig) -> Result<Arc<dyn InventoryProvider>> {
    match &config.path {
        Some(path) => {
            let inventory = FileInventory::new(path);
            if config.watch {
                inventory
                    .watch()
                    .with_context(|| format!("监听库存文件失败: {}", path.display()))?;
            }
            info!("库存文件: {}", path.display());
            Ok(Arc::new(inventory))
        }
        None => {
            warn!("未配置库存文件，使用空库存");
            Ok(Arc::new(StaticInventory::new(Inventory::default())))
        }
    }
}

/// 解析 `--target`：`any`、`all` 或Worker索引
pub fn parse_target(target: &str) -> Result<Targeting> {
    match target {
        "any" => Ok(Targeting::Any),
        "all" => Ok(Targeting::All),
        index => index
            .parse::<usize>()
            .map(Targeting::Worker)
            .map_err(|_| anyhow::anyhow!("无效的目标Worker: {target}，可选 any、all 或Worker索引")),
    }
}

/// 由命令行参数构造作业请求
pub fn build_request(
    function: &str,
    filter_glob: Option<&str>,
    params: Option<&str>,
    target: &str,
) -> Result<JobRequest> {
    let mut request = JobRequest::new(function).with_targeting(parse_target(target)?);
    if let Some(pattern) = filter_glob {
        request = request.with_filter(HostFilter::glob(pattern));
    }
    if let Some(params) = params {
        let params: Map<String, Value> =
            serde_json::from_str(params).context("作业参数必须是JSON对象")?;
        request.params = params;
    }
    Ok(request)
}
