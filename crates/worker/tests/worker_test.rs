use std::sync::Arc;
use std::time::Duration;

use fleetd_core::config::EngineConfig;
use fleetd_core::models::{
    CacheDirective, CacheTarget, CredentialProfile, Device, EventScope, EventStatus, Inventory,
    JobEvent, JobRequest, JobResult, JobStatus, ReconnectEntry, RetryOverrides, WriteMode,
};
use fleetd_core::traits::SubstitutionRenderer;
use fleetd_core::{ErrorKind, HostFilter};
use fleetd_infrastructure::{EventBus, ResultsQueue, StaticInventory};
use fleetd_worker::{
    spawn_worker, BackendRegistry, FunctionRegistry, MockBackend, MockResponse, QueuedJob,
    WorkerDeps, WorkerHandle, WorkerQueue,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Harness {
    _dir: TempDir,
    backend: Arc<MockBackend>,
    inventory: Arc<StaticInventory>,
    results: Arc<ResultsQueue>,
    queue: Arc<WorkerQueue>,
    handle: WorkerHandle,
    events: broadcast::Receiver<JobEvent>,
}

fn device(name: &str, password: &str) -> Device {
    let mut device = Device::new(name);
    device.username = Some("admin".into());
    device.password = Some(password.into());
    device
}

fn sample_inventory() -> Inventory {
    let mut inventory = Inventory::from_devices(vec![
        device("r1", "pw"),
        device("r2", "pw"),
        device("sw1", "pw"),
    ]);
    inventory.defaults.credentials.insert(
        "backup".into(),
        CredentialProfile {
            name: Some("backup".into()),
            params: fleetd_core::models::ConnectionParams {
                password: Some("backup-pw".into()),
                ..Default::default()
            },
        },
    );
    inventory
}

fn engine_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.default_backend = "mock".into();
    config.engine.max_concurrency = 4;
    config.connections.backoff_ms = 0;
    config.connections.connect_retry = 0;
    config.connections.task_retry = 0;
    config.connections.idle_timeout_seconds = 0;
    config.artifacts.base_dir = dir.path().to_path_buf();
    config
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = engine_config(&dir);
        Self::start_with(dir, config).await
    }

    async fn start_with(dir: TempDir, config: EngineConfig) -> Self {
        let backend = Arc::new(MockBackend::new("mock"));
        let mut backends = BackendRegistry::with_defaults();
        backends.register(backend.clone());

        let inventory = Arc::new(StaticInventory::new(sample_inventory()));
        let events = Arc::new(EventBus::new());
        let results = Arc::new(ResultsQueue::new());
        let deps = WorkerDeps {
            provider: inventory.clone(),
            backends: Arc::new(backends),
            functions: Arc::new(FunctionRegistry::with_builtins()),
            renderer: Arc::new(SubstitutionRenderer::new()),
            events: events.clone(),
            results: results.clone(),
        };
        let queue = Arc::new(WorkerQueue::new());
        let subscriber = events.subscribe();
        let handle = spawn_worker(0, Arc::new(config), deps, queue.clone())
            .await
            .unwrap();

        Self {
            _dir: dir,
            backend,
            inventory,
            results,
            queue,
            handle,
            events: subscriber,
        }
    }

    async fn submit(&self, request: JobRequest) -> JobResult {
        let (job, reply) = QueuedJob::new(request);
        self.queue.push(job).await;
        tokio::time::timeout(Duration::from_secs(10), reply)
            .await
            .expect("job did not finish in time")
            .expect("worker dropped the job")
    }

    fn drain_events(&mut self) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn cli(filter: HostFilter, commands: serde_json::Value) -> JobRequest {
    JobRequest::new("cli")
        .with_filter(filter)
        .with_param("commands", commands)
}

#[tokio::test]
async fn test_cli_job_across_devices() {
    let mut harness = Harness::start().await;
    let result = harness
        .submit(cli(HostFilter::glob("r*"), json!(["show version"])))
        .await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.worker, 0);
    assert_eq!(result.succeeded_devices(), vec!["r1", "r2"]);
    assert_eq!(result.devices["r1"].result["show version"], json!("r1: show version"));
    assert_eq!(result.devices["r1"].connect_attempts, 1);

    let stats = harness.handle.stats();
    assert_eq!(stats.worker_jobs_completed, 1);
    assert_eq!(stats.worker_jobs_failed, 0);
    assert!(!stats.busy);
    assert_eq!(stats.open_connections, 2);

    let queued = harness.results.drain().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].job_id, result.job_id);

    let events = harness.drain_events();
    let first = events.first().unwrap();
    let last = events.last().unwrap();
    assert_eq!((first.scope, first.status), (EventScope::Job, EventStatus::Started));
    assert_eq!((last.scope, last.status), (EventScope::Job, EventStatus::Completed));
    let device_done = events
        .iter()
        .filter(|e| e.scope == EventScope::Device && e.status == EventStatus::Completed)
        .count();
    assert_eq!(device_done, 2);

    // 同一设备内的子步骤事件有序
    let r1_steps: Vec<EventStatus> = events
        .iter()
        .filter(|e| e.scope == EventScope::Step && e.device.as_deref() == Some("r1"))
        .map(|e| e.status)
        .collect();
    assert_eq!(r1_steps, vec![EventStatus::Started, EventStatus::Completed]);
}

#[tokio::test]
async fn test_connections_are_reused_between_jobs() {
    let harness = Harness::start().await;
    harness.submit(cli(HostFilter::list(["r1"]), json!("show clock"))).await;
    let second = harness.submit(cli(HostFilter::list(["r1"]), json!("show clock"))).await;

    assert_eq!(second.devices["r1"].connect_attempts, 0);
    assert_eq!(harness.backend.connect_count("r1"), 1);
}

#[tokio::test]
async fn test_wrong_credentials_without_chain() {
    let harness = Harness::start().await;
    harness.backend.require_password("r1", "correct");

    let request = cli(HostFilter::list(["r1", "r2"]), json!("show version")).with_retry(RetryOverrides {
        connect_retry: Some(0),
        ..Default::default()
    });
    let result = harness.submit(request).await;

    assert_eq!(result.status, JobStatus::Completed);
    let r1 = &result.devices["r1"];
    assert!(r1.failed);
    assert_eq!(r1.error_kind(), Some(ErrorKind::ConnectFailed));
    assert_eq!(r1.connect_attempts, 1);
    assert!(!result.devices["r2"].failed);

    let stats = harness.handle.stats();
    assert_eq!(stats.worker_hosts_tasks_failed, 1);
    assert_eq!(stats.hosts_tasks_failed.get("r1"), Some(&1));
    assert_eq!(stats.worker_jobs_completed, 1);
}

#[tokio::test]
async fn test_named_credential_chain() {
    let harness = Harness::start().await;
    harness.backend.require_password("r1", "backup-pw");

    let request = cli(HostFilter::list(["r1"]), json!("show version")).with_retry(RetryOverrides {
        connect_retry: Some(0),
        task_retry: None,
        reconnect: vec![ReconnectEntry::Named("backup".into())],
    });
    let result = harness.submit(request).await;

    let r1 = &result.devices["r1"];
    assert!(!r1.failed);
    assert_eq!(r1.profile_index, Some(0));
    assert_eq!(r1.connect_attempts, 2);
}

#[tokio::test]
async fn test_unknown_credential_name_fails_job() {
    let harness = Harness::start().await;
    let request = cli(HostFilter::list(["r1"]), json!("show version")).with_retry(RetryOverrides {
        reconnect: vec![ReconnectEntry::Named("nope".into())],
        ..Default::default()
    });
    let result = harness.submit(request).await;
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error.unwrap().kind, ErrorKind::InvalidParameters);
}

#[tokio::test]
async fn test_task_retry_on_transient_failure() {
    let harness = Harness::start().await;
    harness.backend.fail_executions("r1", 1);
    harness.backend.fail_executions("r2", 5);

    let request = cli(HostFilter::list(["r1", "r2"]), json!("show version")).with_retry(RetryOverrides {
        task_retry: Some(1),
        ..Default::default()
    });
    let result = harness.submit(request).await;

    let r1 = &result.devices["r1"];
    assert!(!r1.failed);
    assert_eq!(r1.task_retries, 1);

    let r2 = &result.devices["r2"];
    assert!(r2.failed);
    assert_eq!(r2.error_kind(), Some(ErrorKind::Transient));
    assert_eq!(r2.task_retries, 1);
}

#[tokio::test]
async fn test_fatal_failure_does_not_consume_retries() {
    let harness = Harness::start().await;
    harness
        .backend
        .respond("reload", MockResponse::Fatal("not permitted".into()));

    let request = cli(HostFilter::list(["r1"]), json!("reload")).with_retry(RetryOverrides {
        task_retry: Some(3),
        ..Default::default()
    });
    let result = harness.submit(request).await;

    let r1 = &result.devices["r1"];
    assert_eq!(r1.error_kind(), Some(ErrorKind::Fatal));
    assert_eq!(r1.task_retries, 0);
    assert_eq!(harness.backend.execution_count("r1"), 1);
}

#[tokio::test]
async fn test_unknown_function_is_job_level_failure() {
    let harness = Harness::start().await;
    let result = harness.submit(JobRequest::new("napalm_get")).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.devices.is_empty());
    assert!(result.error.unwrap().message.contains("napalm_get"));
    assert_eq!(harness.handle.stats().worker_jobs_failed, 1);
}

#[tokio::test]
async fn test_filter_required_guard() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = engine_config(&dir);
    config.engine.filter_required = true;
    let harness = Harness::start_with(dir, config).await;

    let result = harness.submit(cli(HostFilter::default(), json!("show version"))).await;
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error.unwrap().kind, ErrorKind::FilterRequired);

    let result = harness.submit(cli(HostFilter::glob("sw*"), json!("show version"))).await;
    assert_eq!(result.succeeded_devices(), vec!["sw1"]);
}

#[tokio::test]
async fn test_empty_match_is_not_an_error() {
    let harness = Harness::start().await;
    let result = harness.submit(cli(HostFilter::glob("core-*"), json!("show version"))).await;
    assert_eq!(result.status, JobStatus::Completed);
    assert!(result.devices.is_empty());
}

#[tokio::test]
async fn test_device_timeout() {
    let harness = Harness::start().await;
    harness.backend.set_execute_delay(Duration::from_secs(5));

    let mut request = cli(HostFilter::list(["r1"]), json!("show tech-support"));
    request.timeout_seconds = Some(1);
    let result = harness.submit(request).await;

    let r1 = &result.devices["r1"];
    assert!(r1.failed);
    assert_eq!(r1.error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(harness.handle.stats().worker_hosts_tasks_failed, 1);
}

#[tokio::test]
async fn test_cache_directives_and_admin_ops() {
    let harness = Harness::start().await;
    harness
        .backend
        .respond("show version", MockResponse::Output(json!("4.30")));

    let request = cli(HostFilter::list(["r1", "r2"]), json!("show version"))
        .with_cache(CacheDirective {
            key: "version".into(),
            target: CacheTarget::Device,
            mode: WriteMode::Overwrite,
            select: Some("/show version".into()),
        })
        .with_cache(CacheDirective {
            key: "seen".into(),
            target: CacheTarget::Defaults,
            mode: WriteMode::Accumulate,
            select: Some("/show version".into()),
        });
    harness.submit(request).await;

    let cached = harness
        .submit(JobRequest::new("cache_get").with_param("key", json!("version")))
        .await
        .payload
        .unwrap();
    assert_eq!(cached["devices"]["r1"], json!("4.30"));
    assert_eq!(cached["devices"]["r2"], json!("4.30"));
    assert!(cached["devices"].get("sw1").is_none());

    let all = harness.submit(JobRequest::new("cache_get")).await.payload.unwrap();
    assert_eq!(all["defaults"]["seen"], json!(["4.30", "4.30"]));

    let cleared = harness
        .submit(
            JobRequest::new("cache_clear")
                .with_filter(HostFilter::list(["r1"]))
                .with_param("keys", json!(["version"])),
        )
        .await
        .payload
        .unwrap();
    assert_eq!(cleared["cleared"], json!(1));

    let after = harness
        .submit(JobRequest::new("cache_get").with_param("key", json!("version")))
        .await
        .payload
        .unwrap();
    assert!(after["devices"].get("r1").is_none());
    assert_eq!(after["devices"]["r2"], json!("4.30"));
    assert!(after["defaults"].is_null());
}

#[tokio::test]
async fn test_to_file_and_diff() {
    let harness = Harness::start().await;
    let snapshot = |config: &str| {
        harness
            .backend
            .respond("show running-config", MockResponse::Output(json!(config)));
        cli(HostFilter::list(["r1"]), json!("show running-config"))
            .diff_against("configs")
            .to_file("configs")
    };

    let first = harness.submit(snapshot("hostname r1\nntp server a")).await;
    assert!(first.devices["r1"].diff.is_none());

    let second = harness.submit(snapshot("hostname r1\nntp server b")).await;
    let diff = second.devices["r1"].diff.clone().unwrap();
    assert!(diff.contains("ntp server a"));
    assert!(diff.contains("ntp server b"));

    let listing = harness
        .submit(JobRequest::new("file_list").with_param("filegroup", json!("configs")))
        .await
        .payload
        .unwrap();
    assert_eq!(listing["filegroups"]["configs"]["r1"].as_array().unwrap().len(), 2);

    let read = harness
        .submit(
            JobRequest::new("file_read")
                .with_param("filegroup", json!("configs"))
                .with_param("recent", json!([1, 2])),
        )
        .await
        .payload
        .unwrap();
    let versions = read["r1"].as_array().unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0]["generation"], json!(2));

    let diffed = harness
        .submit(JobRequest::new("file_diff").with_param("filegroup", json!("configs")))
        .await
        .payload
        .unwrap();
    let stored_diff = diffed["r1"].as_str().unwrap();
    assert!(stored_diff.contains("ntp server a"));
    assert!(stored_diff.contains("ntp server b"));

    let removed = harness
        .submit(JobRequest::new("file_remove").with_param("filegroup", json!("configs")))
        .await
        .payload
        .unwrap();
    assert_eq!(removed["removed"], json!(2));
}

#[tokio::test]
async fn test_to_file_failure_marks_device_failed() {
    let dir = tempfile::tempdir().unwrap();
    let config = engine_config(&dir);
    // 文件组位置被普通文件占用，保存时无法创建目录
    let root = dir.path().join("worker-0");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("configs"), "not a directory").unwrap();
    let mut harness = Harness::start_with(dir, config).await;

    harness
        .backend
        .respond("show running-config", MockResponse::Output(json!("hostname r1")));
    let result = harness
        .submit(cli(HostFilter::list(["r1"]), json!("show running-config")).to_file("configs"))
        .await;

    assert_eq!(result.status, JobStatus::Completed);
    let r1 = &result.devices["r1"];
    assert!(r1.failed);
    assert_eq!(r1.error_kind(), Some(ErrorKind::Internal));
    assert!(r1.error.as_ref().unwrap().message.contains("configs"));

    let failed = harness.drain_events().into_iter().any(|event| {
        event.scope == EventScope::Device && event.status == EventStatus::Failed
    });
    assert!(failed);
}

#[tokio::test]
async fn test_disconnect_and_connections() {
    let harness = Harness::start().await;
    harness.submit(cli(HostFilter::default(), json!("show version"))).await;

    let listed = harness.submit(JobRequest::new("connections")).await.payload.unwrap();
    assert_eq!(listed["connections"].as_array().unwrap().len(), 3);

    let closed = harness
        .submit(JobRequest::new("disconnect").with_filter(HostFilter::list(["r1"])))
        .await
        .payload
        .unwrap();
    assert_eq!(closed["count"], json!(1));

    let closed = harness.submit(JobRequest::new("disconnect")).await.payload.unwrap();
    assert_eq!(closed["count"], json!(2));
    assert_eq!(harness.backend.closes().len(), 3);

    let listed = harness.submit(JobRequest::new("connections")).await.payload.unwrap();
    assert!(listed["connections"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_refresh_reloads_inventory_and_drops_state() {
    let harness = Harness::start().await;
    harness
        .submit(
            cli(HostFilter::list(["r1"]), json!("show version")).with_cache(CacheDirective {
                key: "v".into(),
                target: CacheTarget::Device,
                mode: WriteMode::Overwrite,
                select: None,
            }),
        )
        .await;

    let mut inventory = sample_inventory();
    inventory.hosts.insert("r9".into(), device("r9", "pw"));
    harness.inventory.replace(inventory).await;

    let summary = harness.submit(JobRequest::new("refresh")).await.payload.unwrap();
    assert_eq!(summary["inventory_size"], json!(4));
    assert_eq!(summary["closed_connections"], json!(1));
    assert_eq!(summary["cleared_cache_entries"], json!(1));

    let result = harness.submit(cli(HostFilter::list(["r9"]), json!("show version"))).await;
    assert_eq!(result.succeeded_devices(), vec!["r9"]);

    let inventory = harness.submit(JobRequest::new("inventory")).await.payload.unwrap();
    assert_eq!(inventory["count"], json!(4));
    assert!(inventory["hosts"]["r1"].get("password").is_none());
}

#[tokio::test]
async fn test_dry_run_skips_connection() {
    let harness = Harness::start().await;
    let result = harness
        .submit(
            JobRequest::new("cfg")
                .with_filter(HostFilter::list(["r1"]))
                .with_param("config", json!("hostname {{ host.name }}"))
                .dry_run(true),
        )
        .await;

    assert_eq!(result.devices["r1"].result, json!("hostname r1"));
    assert!(harness.backend.connects().is_empty());
}

#[tokio::test]
async fn test_failed_checks_use_check_failed_kind() {
    let harness = Harness::start().await;
    harness
        .backend
        .respond("show ntp", MockResponse::Output(json!("unsynchronized")));
    let request = JobRequest::new("test")
        .with_filter(HostFilter::list(["r1"]))
        .with_param(
            "tests",
            json!([{"command": "show ntp", "test": "!contains", "pattern": "unsynchronized"}]),
        );
    let result = harness.submit(request).await;

    let r1 = &result.devices["r1"];
    assert!(r1.failed);
    assert_eq!(r1.error_kind(), Some(ErrorKind::CheckFailed));
    assert_eq!(r1.result[0]["passed"], json!(false));
    assert_eq!(harness.handle.stats().worker_hosts_tasks_failed, 1);
}

#[tokio::test]
async fn test_stats_admin_op() {
    let harness = Harness::start().await;
    harness.submit(cli(HostFilter::list(["r1"]), json!("show version"))).await;
    let stats = harness.submit(JobRequest::new("stats")).await.payload.unwrap();
    assert_eq!(stats["worker"], json!("fleetd-worker-0"));
    assert_eq!(stats["worker_jobs_completed"], json!(1));
    assert_eq!(stats["busy"], json!(true));
}
