use std::fs;
use std::process::Command;

use change_log::{ChangeLogStore, NewChange, TableDef};
use tempfile::tempdir;

const CONFIG: &str = r#"
[engine]
node_id = "corp-000"
database = "DATABASE"

[[nodes]]
node_id = "corp-000"
node_group = "corp"

[[nodes]]
node_id = "store-001"
node_group = "store"

[[channels]]
channel_id = "sale"
max_batch_size = 10

[[routers]]
router_id = "corp_to_store"
source_node_group = "corp"
target_node_group = "store"
source_table = "orders"
"#;

#[test]
fn test_route_once_then_list_batches() {
    let temp_dir = tempdir().unwrap();
    let database = temp_dir.path().join("router.db");
    let config_path = temp_dir.path().join("change-router.toml");
    fs::write(
        &config_path,
        CONFIG.replace("DATABASE", &database.display().to_string()),
    )
    .unwrap();

    let log = ChangeLogStore::open(&database).unwrap();
    let hist = log
        .register_table(&TableDef::new("orders", &["id"], &["id"]))
        .unwrap();
    log.append(&NewChange::insert(hist, "sale", &[Some("1")]).with_transaction("t1"))
        .unwrap();

    let bin_path = env!("CARGO_BIN_EXE_change-router");

    let output = Command::new(bin_path)
        .arg("--config")
        .arg(&config_path)
        .arg("check-config")
        .output()
        .expect("Failed to execute command");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("Configuration is valid"));

    let output = Command::new(bin_path)
        .arg("--config")
        .arg(&config_path)
        .arg("route")
        .arg("--once")
        .output()
        .expect("Failed to execute command");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("sale: read 1 routed 1"));

    let output = Command::new(bin_path)
        .arg("--config")
        .arg(&config_path)
        .arg("batches")
        .arg("--node")
        .arg("store-001")
        .output()
        .expect("Failed to execute command");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sale"));
    assert!(stdout.contains("NE"));

    // unknown status codes are rejected
    let output = Command::new(bin_path)
        .arg("--config")
        .arg(&config_path)
        .arg("batch-status")
        .arg("--node")
        .arg("store-001")
        .arg("--batch")
        .arg("1")
        .arg("--status")
        .arg("XX")
        .output()
        .expect("Failed to execute command");
    assert!(!output.status.success());
}

#[test]
fn test_check_config_rejects_unknown_identity() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("change-router.toml");
    let database = temp_dir.path().join("router.db");
    let config = CONFIG
        .replace("DATABASE", &database.display().to_string())
        .replace("node_id = \"corp-000\"\ndatabase", "node_id = \"hq-000\"\ndatabase");
    fs::write(&config_path, config).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_change-router"))
        .arg("--config")
        .arg(&config_path)
        .arg("check-config")
        .output()
        .expect("Failed to execute command");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("hq-000"));
}
