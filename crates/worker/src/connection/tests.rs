use std::sync::Arc;
use std::time::Duration;

use fleetd_core::models::{ConnectionOptions, ConnectionParams, CredentialProfile, Device};
use fleetd_core::{EngineError, ErrorKind};

use super::*;
use crate::backends::{BackendRegistry, MockBackend};
use crate::retry::RetryPolicy;

fn setup() -> (ConnectionManager, Arc<MockBackend>) {
    let backend = Arc::new(MockBackend::new("mock"));
    let mut registry = BackendRegistry::with_defaults();
    registry.register(backend.clone());
    (ConnectionManager::new(0, Arc::new(registry)), backend)
}

fn device(name: &str, password: &str) -> Device {
    let mut device = Device::new(name);
    device.username = Some("admin".into());
    device.password = Some(password.into());
    device
}

fn profile(password: &str) -> CredentialProfile {
    CredentialProfile {
        name: None,
        params: ConnectionParams {
            password: Some(password.into()),
            ..Default::default()
        },
    }
}

fn request<'a>(device: &'a Device, policy: &'a RetryPolicy) -> OpenRequest<'a> {
    OpenRequest {
        device,
        backend: "mock",
        via: None,
        force_reopen: false,
        connect: policy,
        reconnect: &[],
    }
}

#[tokio::test]
async fn test_open_reuses_existing_connection() {
    let (manager, backend) = setup();
    let r1 = device("r1", "pw");
    let policy = RetryPolicy::once();

    let first = manager.open(request(&r1, &policy)).await.unwrap();
    assert!(first.newly_opened());
    assert_eq!(first.connect_attempts(), 1);
    drop(first);

    let second = manager.open(request(&r1, &policy)).await.unwrap();
    assert!(!second.newly_opened());
    assert_eq!(second.connect_attempts(), 0);
    assert_eq!(backend.connect_count("r1"), 1);
    assert_eq!(manager.len().await, 1);
}

#[tokio::test]
async fn test_force_reopen_closes_old_connection() {
    let (manager, backend) = setup();
    let r1 = device("r1", "pw");
    let policy = RetryPolicy::once();

    drop(manager.open(request(&r1, &policy)).await.unwrap());
    let lease = manager
        .open(OpenRequest {
            force_reopen: true,
            ..request(&r1, &policy)
        })
        .await
        .unwrap();

    assert!(lease.newly_opened());
    assert_eq!(backend.connect_count("r1"), 2);
    assert_eq!(backend.closes(), vec!["r1".to_string()]);
    assert_eq!(manager.len().await, 1);
}

#[tokio::test]
async fn test_reconnect_chain_reports_profile_index() {
    let (manager, backend) = setup();
    backend.require_password("r1", "good");
    let r1 = device("r1", "wrong");
    let policy = RetryPolicy::once();
    let chain = vec![profile("stale"), profile("good"), profile("never-tried")];

    let lease = manager
        .open(OpenRequest {
            reconnect: &chain,
            ..request(&r1, &policy)
        })
        .await
        .unwrap();

    assert_eq!(lease.profile_index(), Some(1));
    assert_eq!(lease.connect_attempts(), 3);

    let passwords: Vec<Option<String>> = backend
        .connects()
        .into_iter()
        .map(|c| c.params.password)
        .collect();
    assert_eq!(
        passwords,
        vec![Some("wrong".into()), Some("stale".into()), Some("good".into())]
    );
    // 凭据只覆盖密码，用户名来自主凭据
    assert_eq!(
        backend.connects()[2].params.username.as_deref(),
        Some("admin")
    );
}

#[tokio::test]
async fn test_connect_failed_when_all_profiles_exhausted() {
    let (manager, backend) = setup();
    backend.require_password("r1", "good");
    let r1 = device("r1", "wrong");
    let policy = RetryPolicy::new(1, crate::retry::Backoff::none());
    let chain = vec![profile("stale")];

    let err = manager
        .open(OpenRequest {
            reconnect: &chain,
            ..request(&r1, &policy)
        })
        .await
        .err()
        .unwrap();

    match err {
        EngineError::ConnectFailed {
            attempts, message, ..
        } => {
            assert_eq!(attempts, 4);
            assert!(message.contains("invalid credentials"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn test_fatal_connect_skips_chain() {
    let (manager, backend) = setup();
    backend.fatal_connect("r1", "host key mismatch");
    let r1 = device("r1", "pw");
    let policy = RetryPolicy::new(3, crate::retry::Backoff::none());
    let chain = vec![profile("other")];

    let err = manager
        .open(OpenRequest {
            reconnect: &chain,
            ..request(&r1, &policy)
        })
        .await
        .err()
        .unwrap();

    assert_eq!(err.kind(), ErrorKind::ConnectFailed);
    assert_eq!(backend.connect_count("r1"), 1);
}

#[tokio::test]
async fn test_transient_connect_failures_are_retried() {
    let (manager, backend) = setup();
    backend.fail_connects("r1", 2);
    let r1 = device("r1", "pw");
    let policy = RetryPolicy::new(2, crate::retry::Backoff::none());

    let lease = manager.open(request(&r1, &policy)).await.unwrap();
    assert_eq!(lease.connect_attempts(), 3);
    assert_eq!(lease.profile_index(), None);
}

#[tokio::test]
async fn test_via_path_selection() {
    let (manager, backend) = setup();
    let mut r1 = device("r1", "pw");
    let mut options = ConnectionOptions::default();
    options.via.insert(
        "oob".into(),
        ConnectionParams {
            hostname: Some("10.9.9.1".into()),
            ..Default::default()
        },
    );
    r1.connection_options.insert("mock".into(), options);
    let policy = RetryPolicy::once();

    let lease = manager
        .open(OpenRequest {
            via: Some("oob"),
            ..request(&r1, &policy)
        })
        .await
        .unwrap();
    assert_eq!(
        backend.connects()[0].params.hostname.as_deref(),
        Some("10.9.9.1")
    );
    drop(lease);

    let err = manager
        .open(OpenRequest {
            via: Some("console"),
            ..request(&r1, &policy)
        })
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ViaParametersNotFound);

    let err = manager
        .open(OpenRequest {
            backend: "shell",
            via: Some("oob"),
            ..request(&r1, &policy)
        })
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::RedispatchUnsupported);
}

#[tokio::test]
async fn test_changing_via_reopens() {
    let (manager, backend) = setup();
    let mut r1 = device("r1", "pw");
    let mut options = ConnectionOptions::default();
    options.via.insert("oob".into(), ConnectionParams::default());
    r1.connection_options.insert("mock".into(), options);
    let policy = RetryPolicy::once();

    drop(manager.open(request(&r1, &policy)).await.unwrap());
    let lease = manager
        .open(OpenRequest {
            via: Some("oob"),
            ..request(&r1, &policy)
        })
        .await
        .unwrap();

    assert!(lease.newly_opened());
    assert_eq!(backend.connect_count("r1"), 2);
    assert_eq!(manager.list(None).await[0].via.as_deref(), Some("oob"));
}

#[tokio::test]
async fn test_unknown_backend() {
    let (manager, _) = setup();
    let r1 = device("r1", "pw");
    let policy = RetryPolicy::once();
    let err = manager
        .open(OpenRequest {
            backend: "netconf",
            ..request(&r1, &policy)
        })
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::BackendNotFound { .. }));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (manager, backend) = setup();
    let r1 = device("r1", "pw");
    let policy = RetryPolicy::once();
    drop(manager.open(request(&r1, &policy)).await.unwrap());

    assert_eq!(manager.close("mock", "r1").await, CloseStatus::Closed);
    assert_eq!(manager.close("mock", "r1").await, CloseStatus::NothingToClose);
    assert_eq!(manager.close("mock", "missing").await, CloseStatus::NothingToClose);
    assert_eq!(backend.closes().len(), 1);
}

#[tokio::test]
async fn test_idle_sweep_skips_connection_in_use() {
    let (manager, backend) = setup();
    let r1 = device("r1", "pw");
    let r2 = device("r2", "pw");
    let policy = RetryPolicy::once();

    let busy = manager.open(request(&r1, &policy)).await.unwrap();
    drop(manager.open(request(&r2, &policy)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let closed = manager.sweep_idle(Duration::from_millis(10)).await;

    assert_eq!(closed, 1);
    assert_eq!(backend.closes(), vec!["r2".to_string()]);
    let remaining = manager.list(None).await;
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].in_use);

    // 长时间占用的连接在执行中仍然可用
    let output = busy
        .session()
        .await
        .execute("cli", &serde_json::json!({"command": "show clock"}))
        .await
        .unwrap();
    assert_eq!(output, serde_json::json!("r1: show clock"));
    drop(busy);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(manager.sweep_idle(Duration::from_millis(10)).await, 1);
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn test_background_sweeper_closes_idle_connections() {
    let (mut manager, backend) = setup();
    manager.start_idle_sweeper(Duration::from_millis(20));
    let r1 = device("r1", "pw");
    let policy = RetryPolicy::once();
    drop(manager.open(request(&r1, &policy)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.is_empty().await);
    assert_eq!(backend.closes(), vec!["r1".to_string()]);
}

#[tokio::test]
async fn test_close_matching_and_list() {
    let (manager, backend) = setup();
    let policy = RetryPolicy::once();
    for name in ["r1", "r2", "r3"] {
        let d = device(name, "pw");
        drop(manager.open(request(&d, &policy)).await.unwrap());
    }
    let r1 = device("r1", "pw");
    drop(
        manager
            .open(OpenRequest {
                backend: "shell",
                ..request(&r1, &policy)
            })
            .await
            .unwrap(),
    );

    assert_eq!(manager.list(Some("mock")).await.len(), 3);
    assert_eq!(manager.list(None).await.len(), 4);

    let targets = vec!["r1".to_string(), "r2".to_string()];
    let closed = manager.close_matching(Some("mock"), Some(&targets)).await;
    assert_eq!(closed.len(), 2);
    assert_eq!(backend.closes().len(), 2);

    let left: Vec<String> = manager
        .list(None)
        .await
        .into_iter()
        .map(|c| format!("{}/{}", c.backend, c.device))
        .collect();
    assert_eq!(left, vec!["mock/r3".to_string(), "shell/r1".to_string()]);

    assert_eq!(manager.close_all().await, 2);
    assert!(manager.is_empty().await);
}
