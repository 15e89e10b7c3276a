use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

const INVENTORY: &str = r#"
[hosts.r1]
hostname = "127.0.0.1"

[hosts.r2]
hostname = "127.0.0.2"
"#;

fn write_config(dir: &TempDir) -> PathBuf {
    let inventory = dir.path().join("inventory.toml");
    std::fs::write(&inventory, INVENTORY).unwrap();

    let config = format!(
        r#"
[engine]
workers = 2
default_backend = "shell"

[artifacts]
base_dir = "{}"

[inventory]
path = "{}"
"#,
        dir.path().join("artifacts").display(),
        inventory.display()
    );
    let path = dir.path().join("fleetd.toml");
    std::fs::write(&path, config).unwrap();
    path
}

fn fleetd(config: &Path, args: &[&str]) -> Value {
    let output = Command::new(env!("CARGO_BIN_EXE_fleetd"))
        .arg("-c")
        .arg(config)
        .args(["-l", "warn"])
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "fleetd failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_run_cli_job_with_shell_backend() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    let result = fleetd(
        &config,
        &[
            "run",
            "-f",
            "cli",
            "--filter-glob",
            "r1",
            "-p",
            r#"{"commands": ["echo hello"]}"#,
            "-t",
            "1",
        ],
    );

    assert_eq!(result["outcome"], "completed");
    assert_eq!(result["worker"], 1);
    let r1 = &result["devices"]["r1"];
    assert_eq!(r1["failed"], false);
    assert!(r1["result"]["echo hello"].as_str().unwrap().contains("hello"));
    assert!(result["devices"].get("r2").is_none());
}

#[test]
fn test_run_admin_job_on_all_workers() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    let result = fleetd(&config, &["run", "-f", "inventory", "-t", "all"]);
    let workers = result.as_object().unwrap();
    assert_eq!(workers.len(), 2);
    for outcome in workers.values() {
        assert_eq!(outcome["payload"]["count"], 2);
    }
}
