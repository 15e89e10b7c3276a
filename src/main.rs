use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use fleetd_core::config::AppConfig;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod shutdown;

use app::{build_request, Application};
use shutdown::ShutdownManager;

/// 关闭时等待Worker退出的上限
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {}", config_path.map_or("默认路径", |p| p.as_str())))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.engine.workers = *workers;
    }
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    info!("fleetd 在主机 {} 上启动", host);

    match matches.subcommand() {
        Some(("run", args)) => run_once(config, args).await,
        _ => serve(config).await,
    }
}

fn cli() -> Command {
    Command::new("fleetd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("设备集群自动化代理")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .global(true)
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("N")
                .global(true)
                .help("Worker数量")
                .value_parser(clap::value_parser!(usize)),
        )
        .subcommand(Command::new("serve").about("运行Worker池直到收到关闭信号"))
        .subcommand(
            Command::new("run")
                .about("执行单个作业并输出JSON结果")
                .arg(
                    Arg::new("function")
                        .short('f')
                        .long("function")
                        .value_name("NAME")
                        .required(true)
                        .help("作业函数，如 cli、cfg、test、connections"),
                )
                .arg(
                    Arg::new("filter-glob")
                        .long("filter-glob")
                        .value_name("PATTERN")
                        .help("按设备名称的glob过滤"),
                )
                .arg(
                    Arg::new("params")
                        .short('p')
                        .long("params")
                        .value_name("JSON")
                        .help("作业参数（JSON对象）"),
                )
                .arg(
                    Arg::new("target")
                        .short('t')
                        .long("target")
                        .value_name("TARGET")
                        .default_value("any")
                        .help("目标Worker：any、all 或Worker索引"),
                ),
        )
}

async fn serve(config: AppConfig) -> Result<()> {
    let app = std::sync::Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = app.clone();
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.serve(shutdown_rx).await {
                error!("服务运行失败: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");

    let finished = shutdown_manager
        .graceful_shutdown(
            async {
                if let Err(e) = app_handle.await {
                    error!("服务关闭时发生错误: {e}");
                }
            },
            SHUTDOWN_TIMEOUT,
        )
        .await;
    if finished {
        info!("fleetd 已优雅关闭");
    } else {
        app.shutdown().await;
    }
    Ok(())
}

async fn run_once(config: AppConfig, args: &ArgMatches) -> Result<()> {
    let function = args
        .get_one::<String>("function")
        .context("缺少作业函数")?;
    let target = args
        .get_one::<String>("target")
        .map_or("any", String::as_str);
    let request = build_request(
        function,
        args.get_one::<String>("filter-glob").map(String::as_str),
        args.get_one::<String>("params").map(String::as_str),
        target,
    )?;

    let app = Application::new(config).await?;
    let response = app.run_job(request).await;
    app.shutdown().await;

    let output = serde_json::to_string_pretty(&response?).context("序列化作业结果失败")?;
    println!("{output}");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 日志写到stderr，stdout留给作业结果
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        _ => return Err(anyhow::anyhow!("不支持的日志格式: {log_format}")),
    }

    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
