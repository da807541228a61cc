//! Command-line behavior of the silo-server binary.

use crate::helpers::{run_server, write_config};

#[test]
fn config_template_prints_defaults() {
    let output = run_server(&["--config-template"]);
    assert!(output.status.success(), "exit code: {:?}", output.status);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("port = 11111"), "got: {stdout}");
    assert!(stdout.contains("[membership]"));
    assert!(stdout.contains("probe_timeout = \"10s\""));
    assert!(stdout.contains("[ring]"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[ring]\nnum_buckets_per_silo = 0\n");

    let output = run_server(&["--config", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("num_buckets_per_silo"), "got: {stderr}");
}

#[test]
fn unreadable_config_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");

    let output = run_server(&["--config", missing.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nope.toml"), "got: {stderr}");
}

#[test]
fn hosting_a_remote_table_is_rejected() {
    let output = run_server(&[
        "--table-remote",
        "127.0.0.1:30000",
        "--table-service-port",
        "30001",
    ]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("table_service_port"), "got: {stderr}");
}
