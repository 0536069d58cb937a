//! Integration tests for the gridflow binary.

use std::process::Command;

fn gridflow() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_gridflow"));
    cmd.env_remove("GRIDFLOW_CONFIG").env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_config_prints_defaults() {
    let output = gridflow().arg("config").output().expect("Failed to run gridflow config");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "Command failed: {}", stderr);

    let config: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("Invalid JSON in config output");
    assert_eq!(config["coordinator"]["max_concurrent"], 10);
    assert_eq!(config["batcher"]["max_size"], 50);
    assert_eq!(config["max_pending_operations"], 10000);
}

#[test]
fn test_config_applies_preset_and_env() {
    let output = gridflow()
        .args(["config", "--preset", "high-throughput"])
        .env("GRIDFLOW_BATCH_MAX_SIZE", "7")
        .output()
        .expect("Failed to run gridflow config");
    assert!(output.status.success());

    let config: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["coordinator"]["max_concurrent"], 20);
    assert_eq!(config["batcher"]["max_size"], 7);
}

#[test]
fn test_invalid_env_override_fails() {
    let output = gridflow()
        .arg("config")
        .env("GRIDFLOW_MAX_CONCURRENT", "lots")
        .output()
        .expect("Failed to run gridflow config");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("GRIDFLOW_MAX_CONCURRENT"));
}

#[test]
fn test_simulate_json_report() {
    let output = gridflow()
        .args(["simulate", "--reads", "60", "--writes", "20", "--latency-ms", "1", "--json"])
        .output()
        .expect("Failed to run gridflow simulate");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "Command failed: {}", stderr);

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("Invalid JSON in simulate output");
    assert_eq!(report["operations"], 80);
    assert_eq!(report["succeeded"], 80);
    let calls = report["upstream_calls"].as_u64().unwrap();
    assert!(calls > 0 && calls < 80, "expected fewer upstream calls than operations, got {calls}");
    assert_eq!(report["stats"]["batcher"]["writes_received"], 20);
}

#[test]
fn test_simulate_text_report() {
    let output = gridflow()
        .args(["simulate", "--reads", "10", "--writes", "2", "--latency-ms", "0"])
        .output()
        .expect("Failed to run gridflow simulate");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("gridflow simulate"), "Missing banner");
    assert!(stdout.contains("Operations:"), "Missing operation count");
    assert!(stdout.contains("Write batches:"), "Missing batch summary");
}
