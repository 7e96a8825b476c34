//! Smoke tests -- verify the binary runs, parses its config and fails cleanly
//! when the traffic generator is missing.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn tsnbench() -> Command {
    let mut cmd = Command::cargo_bin("tsnbench").unwrap();
    cmd.env_remove("TSNBENCH_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_cli_help() {
    tsnbench()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("RFC 2544"));
}

#[test]
fn test_cli_version() {
    tsnbench()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tsnbench"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["check", "throughput", "frame-loss", "back-to-back", "latency", "suite"] {
        tsnbench().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_throughput_help_lists_search_overrides() {
    tsnbench()
        .args(["throughput", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--floor-mbps"))
        .stdout(predicate::str::contains("--max-iterations"))
        .stdout(predicate::str::contains("--json"));
}

#[test]
fn test_floor_above_ceiling_is_rejected() {
    tsnbench()
        .args(["throughput", "--floor-mbps", "2000", "--ceiling-mbps", "1000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid search configuration"));
}

#[test]
fn test_missing_iperf3_reports_probe_failure() {
    tsnbench()
        .args([
            "throughput",
            "--iperf3-path",
            "/nonexistent/iperf3",
            "--trial-secs",
            "1",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("iperf3 not found at /nonexistent/iperf3"))
        .stderr(predicate::str::contains("last sustained rate"));
}

#[test]
fn test_hyphenated_target_is_rejected() {
    tsnbench()
        .args(["throughput", "--target=-R"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot start with a hyphen"));
}

#[test]
fn test_frame_loss_counts_failed_trials() {
    let output = tsnbench()
        .args([
            "frame-loss",
            "--iperf3-path",
            "/nonexistent/iperf3",
            "--loads",
            "50,100",
            "--trials",
            "1",
            "--json",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let loads = report["loads"].as_array().unwrap();
    assert_eq!(loads.len(), 2);
    assert_eq!(loads[0]["offered_load_pct"], 50.0);
    assert_eq!(loads[0]["failed_trials"], 1);
    assert!(loads[1]["avg_loss_pct"].is_null());
}

#[test]
fn test_unparseable_config_fails() {
    let file = config_file("[search\nfloor_mbps = ");
    tsnbench()
        .arg("--config")
        .arg(file.path())
        .args(["throughput", "--help"])
        .assert()
        .success();
    tsnbench()
        .arg("--config")
        .arg(file.path())
        .arg("throughput")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config file"));
}

#[test]
fn test_config_from_environment_is_applied() {
    let file = config_file(
        r#"
[search]
floor_mbps = 500.0
ceiling_mbps = 100.0
"#,
    );
    tsnbench()
        .env("TSNBENCH_CONFIG", file.path())
        .arg("throughput")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid search configuration"));
}

#[test]
fn test_explicit_missing_config_fails() {
    tsnbench()
        .args(["--config", "/nonexistent/tsnbench.toml", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn test_non_positive_load_is_rejected() {
    tsnbench()
        .args(["frame-loss", "--iperf3-path", "/nonexistent/iperf3", "--loads", "50,0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("offered load must be a positive percentage"));
}

#[test]
fn test_latency_offers_sockperf() {
    tsnbench()
        .args(["latency", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sockperf"));
}

#[test]
fn test_missing_sockperf_fails_cleanly() {
    tsnbench()
        .args([
            "latency",
            "--tool",
            "sockperf",
            "--sockperf-path",
            "/nonexistent/sockperf",
            "--frame-size",
            "64",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/sockperf not found"));
}
