//! End-to-end CLI integration tests.
//!
//! gpu-scan codegen <FILE> [--estimate]
//! gpu-scan run [--scan FILE] [--config FILE] [--rows N] [--format table|json] [--metrics]

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

/// Run gpu-scan with given args and return (stdout, stderr, exit_code).
fn run_cli(args: &[&str]) -> (String, String, i32) {
    let bin = env!("CARGO_BIN_EXE_gpu-scan");
    let output = Command::new(bin)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?}: {}", bin, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);
    (stdout, stderr, code)
}

const SCAN: &str = r#"{
    "columns": [
        {"name": "id", "data_type": "int4", "nullable": false},
        {"name": "v", "data_type": "int4"}
    ],
    "quals": [
        {"kind": "cmp", "op": "ge",
         "left": {"kind": "var", "varno": 1, "attnum": 2, "data_type": "int4"},
         "right": {"kind": "const", "value": {"Int4": 90}, "data_type": "int4"}}
    ],
    "target_list": [
        {"name": "id", "expr": {"kind": "var", "varno": 1, "attnum": 1, "data_type": "int4"}}
    ],
    "destination": "slot"
}"#;

fn write(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write file");
    path.to_string_lossy().to_string()
}

// ---- codegen ----

#[test]
fn test_codegen_prints_kernel() {
    let dir = TempDir::new().unwrap();
    let scan = write(dir.path(), "scan.json", SCAN);
    let (stdout, _, code) = run_cli(&["codegen", &scan, "--estimate"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("kernel void gpuscan_exec_quals_row("));
    assert!(stdout.contains("// buffer estimate"));
}

#[test]
fn test_codegen_missing_file_fails() {
    let (_, stderr, code) = run_cli(&["codegen", "/nonexistent/scan.json"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("Error"));
}

#[test]
fn test_codegen_rejects_non_boolean_qual() {
    let dir = TempDir::new().unwrap();
    let scan = write(
        dir.path(),
        "scan.json",
        r#"{
            "columns": [{"name": "v", "data_type": "int4"}],
            "quals": [{"kind": "var", "varno": 1, "attnum": 1, "data_type": "int4"}]
        }"#,
    );
    let (_, stderr, code) = run_cli(&["codegen", &scan]);
    assert_eq!(code, 1);
    assert!(stderr.contains("expected bool"), "stderr: {}", stderr);
}

// ---- run ----

#[test]
fn test_run_demo_table() {
    let (stdout, _, code) = run_cli(&["run", "--rows", "500", "--limit", "3"]);
    assert_eq!(code, 0);
    let first = stdout.lines().next().unwrap();
    assert!(first.contains("id") && first.contains("doubled"), "header: {}", first);
    assert!(stdout.contains(" rows, "));
}

#[test]
fn test_run_json_with_config_and_metrics() {
    let dir = TempDir::new().unwrap();
    let scan = write(dir.path(), "scan.json", SCAN);
    let config = write(
        dir.path(),
        "config.json",
        r#"{"chunk_size": "4MB", "stream_threads": 1, "max_concurrent_tasks": 2}"#,
    );
    let (stdout, stderr, code) = run_cli(&[
        "run", "--scan", &scan, "--config", &config, "--rows", "1000", "--limit", "1000",
        "--format", "json", "--metrics",
    ]);
    assert_eq!(code, 0, "stderr: {}", stderr);

    let mut lines = stdout.lines();
    let rows: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
    let rows = rows.as_array().unwrap();
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|r| r.get("id").is_some() && r.get("v").is_none()));

    let metrics: serde_json::Value = serde_json::from_str(&lines.collect::<Vec<_>>().join("\n")).unwrap();
    assert_eq!(metrics["rows_returned"].as_u64().unwrap() as usize, rows.len());
    assert!(metrics["tasks"].as_u64().unwrap() >= 1);
}

#[test]
fn test_run_rejects_bad_config() {
    let dir = TempDir::new().unwrap();
    let config = write(dir.path(), "config.json", r#"{"chunk_size": "1KB"}"#);
    let (_, stderr, code) = run_cli(&["run", "--config", &config, "--rows", "10"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("chunk_size"), "stderr: {}", stderr);
}
