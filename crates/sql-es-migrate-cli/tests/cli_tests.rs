//! CLI integration tests for sql-es-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes for error conditions, and a few end-to-end runs against
//! in-memory connections declared in the config file.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the sql-es-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("sql-es-migrate").unwrap()
}

const MEMORY_CONFIG: &str = r#"
connections:
  sources:
    shop:
      type: memory
      columns:
        - { name: id, type: INTEGER }
        - { name: name, type: VARCHAR(50) }
        - { name: amount, type: VARCHAR(20) }
      rows:
        - [1, "Alice", "10.50"]
        - [2, "Bob", "abc"]
  targets:
    search:
      type: memory
engine:
  chunk_size: 10
  retry: { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 2 }
mappings:
  - name: orders
    source_connection: shop
    source_query: SELECT id, name, amount FROM orders
    target_connection: search
    target_index: orders
    identity_key: id
    field_mappings:
      - { source_field: id, target_field: id, target_type: long }
      - { source_field: name, target_field: customer, target_type: keyword }
      - { source_field: amount, target_field: amount, target_type: double }
"#;

fn config_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", content).unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("preview"))
        .stdout(predicate::str::contains("suggest"))
        .stdout(predicate::str::contains("validate-mapping"))
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("reprocess"))
        .stdout(predicate::str::contains("dead-letters"))
        .stdout(predicate::str::contains("validate-counts"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_suggest_subcommand_help() {
    cmd()
        .args(["suggest", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--source"))
        .stdout(predicate::str::contains("--target"))
        .stdout(predicate::str::contains("--query"))
        .stdout(predicate::str::contains("--index"));
}

#[test]
fn test_sync_subcommand_help() {
    cmd()
        .args(["sync", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--watch"));
}

#[test]
fn test_preview_limit_default() {
    cmd()
        .args(["preview", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--limit"))
        .stdout(predicate::str::contains("[default: 5]"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sql-es-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_exist() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("--verbosity"));
}

#[test]
fn test_config_default_path() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let file = config_file("invalid: yaml: content: [\n");

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_unknown_connection_exits_with_code_1() {
    let file = config_file(
        r#"
mappings:
  - name: orders
    source_connection: nowhere
    source_query: SELECT 1
    target_connection: search
    target_index: orders
    field_mappings:
      - { source_field: id, target_field: id, target_type: long }
"#,
    );

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown source connection"));
}

#[test]
fn test_unknown_mapping_exits_with_code_1() {
    let file = config_file(MEMORY_CONFIG);

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run", "customers"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("mapping 'customers' not found"));
}

#[test]
fn test_unknown_job_exits_with_code_5() {
    let file = config_file(MEMORY_CONFIG);

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "jobs", "--id", "42"])
        .assert()
        .code(5);
}

// =============================================================================
// End-to-end against in-memory connections
// =============================================================================

#[test]
fn test_run_completes_and_dead_letters_bad_record() {
    let file = config_file(MEMORY_CONFIG);

    let output = cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--output-json",
            "run",
            "orders",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let job: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(job["status"], "completed");
    assert_eq!(job["processed_records"], 2);
    assert_eq!(job["failed_records"], 1);
    assert_eq!(job["progress_percentage"], 100.0);
}

#[test]
fn test_preview_reports_documents_and_errors() {
    let file = config_file(MEMORY_CONFIG);

    let output = cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--output-json",
            "preview",
            "orders",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let preview: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(preview["original_rows"].as_array().unwrap().len(), 2);
    let docs = preview["transformed_documents"].as_array().unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["customer"], "Alice");
    assert_eq!(preview["errors"][0]["field"], "amount");
}

#[test]
fn test_validate_mapping_reports_valid() {
    let file = config_file(MEMORY_CONFIG);

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "validate-mapping",
            "orders",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Mapping 'orders' is valid"));
}

#[test]
fn test_health_check_with_memory_connections() {
    let file = config_file(MEMORY_CONFIG);

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("HEALTHY"));
}

#[test]
fn test_sync_without_change_tracking_exits_with_code_1() {
    let file = config_file(MEMORY_CONFIG);

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "sync"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no mappings with change_tracking"));
}
