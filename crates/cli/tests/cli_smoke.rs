//! CLI smoke tests for kapply.
//!
//! Everything here runs without a cluster: rendering is local, and apply
//! commands are only exercised up to the point where they need a client.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the kapply binary.
fn kapply_cmd() -> Command {
  let mut cmd = cargo_bin_cmd!("kapply");
  cmd.env_remove("KAPPLY_KUBECONFIG").env_remove("KAPPLY_CONFIG");
  cmd
}

const NAMESPACE: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: {{ .Namespace }}
  labels:
    openshift.io/run-level: "0"
"#;

/// Create a temp directory holding one manifest.
fn temp_manifests() -> TempDir {
  let temp = TempDir::new().unwrap();
  std::fs::write(temp.path().join("ns.yaml"), NAMESPACE).unwrap();
  temp
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  kapply_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  kapply_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("kapply"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["render", "apply", "crds"] {
    kapply_cmd()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// Render
// =============================================================================

#[test]
fn render_substitutes_parameters() {
  let temp = temp_manifests();
  kapply_cmd()
    .args(["render", "--dir"])
    .arg(temp.path())
    .args(["--set", "Namespace=openshift-dns", "ns.yaml"])
    .assert()
    .success()
    .stdout(predicate::str::contains("name: openshift-dns"));
}

#[test]
fn render_reads_params_file() {
  let temp = temp_manifests();
  std::fs::write(temp.path().join("params.yaml"), "Namespace: openshift-ingress\n").unwrap();
  kapply_cmd()
    .args(["render", "--dir"])
    .arg(temp.path())
    .arg("--params")
    .arg(temp.path().join("params.yaml"))
    .arg("ns.yaml")
    .assert()
    .success()
    .stdout(predicate::str::contains("name: openshift-ingress"));
}

#[test]
fn render_check_reports_kind_as_json() {
  let temp = temp_manifests();
  kapply_cmd()
    .args(["render", "--check", "--format", "json", "--dir"])
    .arg(temp.path())
    .args(["--set", "Namespace=openshift-dns", "ns.yaml"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"kind\": \"Namespace\""))
    .stdout(predicate::str::contains("\"name\": \"openshift-dns\""));
}

#[test]
fn render_fails_on_missing_parameter() {
  let temp = temp_manifests();
  kapply_cmd()
    .args(["render", "--dir"])
    .arg(temp.path())
    .arg("ns.yaml")
    .assert()
    .failure()
    .stderr(predicate::str::contains("failed to render ns.yaml"));
}

#[test]
fn render_fails_on_missing_manifest() {
  let temp = temp_manifests();
  kapply_cmd()
    .args(["render", "--dir"])
    .arg(temp.path())
    .arg("nope.yaml")
    .assert()
    .failure()
    .stderr(predicate::str::contains("failed to fetch nope.yaml"));
}

#[test]
fn render_rejects_malformed_set() {
  let temp = temp_manifests();
  kapply_cmd()
    .args(["render", "--dir"])
    .arg(temp.path())
    .args(["--set", "Namespace", "ns.yaml"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("expected KEY=VALUE"));
}

// =============================================================================
// Apply
// =============================================================================

#[test]
fn apply_requires_manifests() {
  kapply_cmd().arg("apply").assert().failure();
}

#[test]
fn apply_reports_unreadable_kubeconfig() {
  let temp = temp_manifests();
  kapply_cmd()
    .args(["apply", "--dir"])
    .arg(temp.path())
    .arg("--kubeconfig")
    .arg(temp.path().join("missing.kubeconfig"))
    .args(["--set", "Namespace=openshift-dns", "ns.yaml"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("invalid kubeconfig"));
}

#[test]
fn apply_reports_bad_config() {
  let temp = temp_manifests();
  std::fs::write(temp.path().join("kapply.toml"), "request_timeout = \"soon\"\n").unwrap();
  kapply_cmd()
    .arg("--config")
    .arg(temp.path().join("kapply.toml"))
    .args(["apply", "--dir"])
    .arg(temp.path())
    .arg("ns.yaml")
    .assert()
    .failure()
    .stderr(predicate::str::contains("failed to load"));
}

#[test]
fn crds_accepts_timeout() {
  let temp = temp_manifests();
  kapply_cmd()
    .env("KAPPLY_KUBECONFIG", temp.path().join("missing.kubeconfig"))
    .args(["crds", "--timeout", "30s", "--dir"])
    .arg(temp.path())
    .arg("ns.yaml")
    .assert()
    .failure()
    .stderr(predicate::str::contains("invalid kubeconfig"));
}

#[test]
fn crds_rejects_zero_interval_config() {
  let temp = temp_manifests();
  std::fs::write(temp.path().join("kapply.toml"), "[establish]\ninterval = \"0s\"\n").unwrap();
  kapply_cmd()
    .arg("--config")
    .arg(temp.path().join("kapply.toml"))
    .args(["crds", "--dir"])
    .arg(temp.path())
    .arg("ns.yaml")
    .assert()
    .failure()
    .stderr(predicate::str::contains("establish.interval must be greater than zero"));
}

#[test]
fn crds_rejects_zero_timeout() {
  let temp = temp_manifests();
  kapply_cmd()
    .args(["crds", "--timeout", "0s", "--dir"])
    .arg(temp.path())
    .arg("ns.yaml")
    .assert()
    .failure()
    .stderr(predicate::str::contains("invalid --timeout"));
}
