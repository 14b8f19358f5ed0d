mod common;

use std::process::Command;

fn ingest_command() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_portfolio-ingest"));
    for var in [
        "PORTFOLIO_SOURCE_DIR",
        "PORTFOLIO_MAX_CHUNK_SIZE",
        "PORTFOLIO_MIN_CHUNK_SIZE",
        "PORTFOLIO_CHUNK_OVERLAP",
        "PORTFOLIO_STORE",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn missing_source_directory_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = ingest_command()
        .arg("--dry-run")
        .arg("--source-dir")
        .arg(dir.path().join("does-not-exist"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does-not-exist"), "stderr: {stderr}");
}

#[test]
fn dry_run_reports_document_and_chunk_counts() {
    let dir = tempfile::tempdir().unwrap();
    common::write_portfolio(dir.path());
    let output = ingest_command()
        .arg("--dry-run")
        .arg("--source-dir")
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("2 documents, "), "stdout: {stdout}");
}

#[test]
fn invalid_chunking_options_exit_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = ingest_command()
        .args(["--dry-run", "--max-chunk-size", "100", "--chunk-overlap", "150"])
        .arg("--source-dir")
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
}
