#![allow(clippy::unwrap_used)]
//! End-to-end tests for the `trainkit` binary.

use std::fs::{self, File};
use std::path::Path;
use std::process::{Command, Output};
use std::thread;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;

const LAUNCHER_VARS: &[&str] = &[
    "OMPI_COMM_WORLD_RANK",
    "OMPI_COMM_WORLD_SIZE",
    "OMPI_COMM_WORLD_LOCAL_RANK",
    "PMI_RANK",
    "PMI_SIZE",
    "MPI_LOCALRANKID",
    "RANK",
    "WORLD_SIZE",
    "LOCAL_RANK",
];

const CONFIG_VARS: &[&str] = &[
    "TRAINKIT_LOCK_PATH",
    "TRAINKIT_LOCK_RELEASE_DELAY_MS",
    "TRAINKIT_LOCAL_MODE_HOST",
    "TRAINKIT_LOCAL_MODE_PORT",
];

/// The binary with no launcher variables inherited from the test runner.
fn trainkit() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_trainkit"));
    for var in LAUNCHER_VARS.iter().chain(CONFIG_VARS) {
        cmd.env_remove(var);
    }
    cmd.env_remove("RUST_LOG");
    cmd
}

fn fixture(rank: &str, size: &str) -> Output {
    trainkit()
        .arg("failure-fixture")
        .env("OMPI_COMM_WORLD_RANK", rank)
        .env("OMPI_COMM_WORLD_SIZE", size)
        .output()
        .unwrap()
}

fn write_tar_gz(dir: &Path, group: &str, members: &[&str]) {
    let file = File::create(dir.join(format!("{group}.tar.gz"))).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for member in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, member, std::io::empty())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// failure-fixture
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn fixture_rank_zero_exits_non_zero() {
    let out = fixture("0", "2");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("failure!"), "stderr: {stderr}");
}

#[test]
fn fixture_other_rank_exits_zero() {
    let out = fixture("1", "2");
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn fixture_outside_launcher_is_rank_zero() {
    let out = trainkit().arg("failure-fixture").output().unwrap();
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn fixture_bad_environment_is_reported() {
    let out = fixture("1", "zero");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("OMPI_COMM_WORLD_SIZE"), "stderr: {stderr}");
}

#[test]
fn fixture_rejects_unknown_communicator() {
    let out = trainkit()
        .args(["failure-fixture", "--communicator", "ring"])
        .env("RANK", "1")
        .env("WORLD_SIZE", "2")
        .output()
        .unwrap();
    assert!(!out.status.success());
}

// ─────────────────────────────────────────────────────────────────────────────
// verify-archives
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn verify_archives_all_present() {
    let tmp = TempDir::new().unwrap();
    write_tar_gz(tmp.path(), "g", &["a", "b"]);

    let out = trainkit()
        .arg("verify-archives")
        .arg("--output-path")
        .arg(tmp.path())
        .args(["--expect", "g=a,b"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("All 1 archive(s)"), "stdout: {stdout}");
}

#[test]
fn verify_archives_reports_missing_member() {
    let tmp = TempDir::new().unwrap();
    write_tar_gz(tmp.path(), "g", &["a", "b"]);

    let out = trainkit()
        .arg("verify-archives")
        .arg("--output-path")
        .arg(tmp.path())
        .args(["--expect", "g=a,c"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("missing member 'c'"), "stdout: {stdout}");
}

#[test]
fn verify_archives_json_output() {
    let tmp = TempDir::new().unwrap();
    write_tar_gz(tmp.path(), "model", &["model.npz"]);

    let out = trainkit()
        .arg("verify-archives")
        .arg("--output-path")
        .arg(tmp.path())
        .args(["--expect", "model=model.npz", "--expect", "output=data/log", "--json"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["archives_checked"], 1);
    assert_eq!(report["archive_errors"][0]["group"], "output");
}

// ─────────────────────────────────────────────────────────────────────────────
// with-lock
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn with_lock_propagates_child_exit_code() {
    let tmp = TempDir::new().unwrap();
    let lock = tmp.path().join("local_mode_lock");
    let exe = env!("CARGO_BIN_EXE_trainkit");

    let ok = trainkit()
        .arg("with-lock")
        .arg("--lock-path")
        .arg(&lock)
        .args(["--release-delay-ms", "0", "--", exe, "failure-fixture"])
        .env("RANK", "1")
        .env("WORLD_SIZE", "2")
        .status()
        .unwrap();
    assert!(ok.success());
    assert!(lock.is_file());

    let failed = trainkit()
        .arg("with-lock")
        .arg("--lock-path")
        .arg(&lock)
        .args(["--release-delay-ms", "0", "--", exe, "failure-fixture"])
        .env("RANK", "0")
        .env("WORLD_SIZE", "2")
        .status()
        .unwrap();
    assert_eq!(failed.code(), Some(1));
}

#[test]
fn with_lock_missing_program_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let out = trainkit()
        .arg("with-lock")
        .arg("--lock-path")
        .arg(tmp.path().join("lock"))
        .args(["--release-delay-ms", "0", "--", "/nonexistent/trainkit-child"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("failed to run"), "stderr: {stderr}");
}

#[test]
fn with_lock_rejects_invalid_local_mode_port() {
    let tmp = TempDir::new().unwrap();
    let out = trainkit()
        .arg("with-lock")
        .arg("--lock-path")
        .arg(tmp.path().join("lock"))
        .args(["--", env!("CARGO_BIN_EXE_trainkit"), "--help"])
        .env("TRAINKIT_LOCAL_MODE_PORT", "eighty")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("TRAINKIT_LOCAL_MODE_PORT"), "stderr: {stderr}");
}

#[test]
fn with_lock_reads_lock_path_from_environment() {
    let tmp = TempDir::new().unwrap();
    let lock = tmp.path().join("from_env").join("local_mode_lock");
    let status = trainkit()
        .args(["with-lock", "--", env!("CARGO_BIN_EXE_trainkit"), "--help"])
        .env("TRAINKIT_LOCK_PATH", &lock)
        .env("TRAINKIT_LOCK_RELEASE_DELAY_MS", "0")
        .status()
        .unwrap();
    assert!(status.success());
    assert!(lock.is_file());
}

#[cfg(unix)]
#[test]
fn with_lock_serializes_separate_processes() {
    let tmp = TempDir::new().unwrap();
    let lock = tmp.path().join("local_mode_lock");
    let log = tmp.path().join("sections.log");
    let script = format!(
        "echo start >> '{log}'; sleep 0.3; echo end >> '{log}'",
        log = log.display()
    );

    let spawn_holder = || {
        trainkit()
            .arg("with-lock")
            .arg("--lock-path")
            .arg(&lock)
            .args(["--release-delay-ms", "0", "--", "sh", "-c", script.as_str()])
            .spawn()
            .unwrap()
    };
    let mut first = spawn_holder();
    thread::sleep(Duration::from_millis(50));
    let mut second = spawn_holder();

    assert!(first.wait().unwrap().success());
    assert!(second.wait().unwrap().success());

    let sections = fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = sections.lines().collect();
    assert_eq!(lines, ["start", "end", "start", "end"], "log: {sections}");
}
