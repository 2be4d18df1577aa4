use anyhow::Result;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Helper to run the CLI binary with given args, offline, against a database
/// inside `temp_dir`
fn run_cli(temp_dir: &TempDir, args: &[&str]) -> Result<Output> {
    let output = Command::new(env!("CARGO_BIN_EXE_quiver"))
        .current_dir(temp_dir.path())
        .arg("--database")
        .arg(temp_dir.path().join("quiver.db"))
        .arg("--offline")
        .args(args)
        .env("RUST_LOG", "error") // Reduce log noise
        .output()?;
    Ok(output)
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{what} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Helper to create a small corpus of files
fn write_corpus(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir.join("notes"))?;
    std::fs::write(
        dir.join("notes/rust.md"),
        "Rust async runtimes schedule futures on worker threads",
    )?;
    std::fs::write(
        dir.join("notes/bread.txt"),
        "Sourdough bread needs a lively starter and a long proof",
    )?;
    std::fs::write(dir.join("notes/.hidden.md"), "never ingested")?;
    std::fs::write(dir.join("notes/photo.png"), [0x89, b'P', b'N', b'G'])?;
    std::fs::write(dir.join("notes/empty.txt"), "   ")?;
    Ok(())
}

/// Test that the binary runs and lists its subcommands
#[test]
fn test_cli_help() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let output = run_cli(&temp_dir, &["--help"])?;
    assert_success(&output, "help");

    let stdout = String::from_utf8(output.stdout)?;
    for command in [
        "init",
        "create-collection",
        "collections",
        "ingest",
        "search",
        "delete",
        "rebuild",
        "stats",
        "status",
        "models",
    ] {
        assert!(stdout.contains(command), "help is missing {command}");
    }

    Ok(())
}

#[test]
fn test_cli_init_and_empty_listing() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;

    let output = run_cli(&temp_dir, &["init"])?;
    assert_success(&output, "init");
    assert!(String::from_utf8(output.stdout)?.contains("Initialized database"));
    assert!(temp_dir.path().join("quiver.db").exists());

    let output = run_cli(&temp_dir, &["collections"])?;
    assert_success(&output, "collections");
    assert!(String::from_utf8(output.stdout)?.contains("Found 0 collections"));

    Ok(())
}

#[test]
fn test_cli_models() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;

    let output = run_cli(&temp_dir, &["models", "--format", "json"])?;
    assert_success(&output, "models");
    let models: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let ids: Vec<&str> = models
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert!(ids.contains(&"nomic-embed-text"));
    assert!(ids.contains(&"all-minilm"));

    Ok(())
}

/// Create, ingest, search, stats, rebuild, delete
#[test]
fn test_cli_happy_path() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    write_corpus(temp_dir.path())?;

    let output = run_cli(
        &temp_dir,
        &["create-collection", "docs", "--model", "all-minilm", "--m", "8"],
    )?;
    assert_success(&output, "create-collection");
    assert!(String::from_utf8(output.stdout)?.contains("dimension 384"));

    let corpus = temp_dir.path().join("notes");
    let output = run_cli(
        &temp_dir,
        &["ingest", "docs", corpus.to_str().unwrap(), "--format", "json"],
    )?;
    assert_success(&output, "ingest");
    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    // the hidden file is never walked; the image and the blank file are skipped
    assert_eq!(report["files_found"], 2);
    assert_eq!(report["files_skipped"], 2);
    assert_eq!(report["submissions"][0]["completed"], 2);
    assert!(report["dead_letters"].as_array().unwrap().is_empty());

    let output = run_cli(
        &temp_dir,
        &[
            "search",
            "docs",
            "Sourdough bread needs a lively starter and a long proof",
            "--limit",
            "1",
            "--format",
            "json",
        ],
    )?;
    assert_success(&output, "search");
    let response: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let hits = response["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0]["source_id"].as_str().unwrap().ends_with("bread.txt"));
    assert_eq!(hits[0]["metadata"]["extension"], "txt");

    // filters narrow the candidates
    let output = run_cli(
        &temp_dir,
        &["search", "docs", "bread", "--filter", "extension=md", "--format", "json"],
    )?;
    assert_success(&output, "filtered search");
    let response: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    for hit in response["hits"].as_array().unwrap() {
        assert_eq!(hit["metadata"]["extension"], "md");
    }

    let output = run_cli(&temp_dir, &["stats", "docs", "--format", "json"])?;
    assert_success(&output, "stats");
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(stats[0]["stats"]["live_records"], 2);

    let output = run_cli(&temp_dir, &["rebuild", "docs", "--ef-search", "32"])?;
    assert_success(&output, "rebuild");
    assert!(String::from_utf8(output.stdout)?.contains("ef_search=32"));

    let output = run_cli(&temp_dir, &["status", "--format", "json"])?;
    assert_success(&output, "status");
    let status: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(status["health"]["overall_status"], "Healthy");
    assert_eq!(status["consistency"]["overall_status"], "Healthy");

    let output = run_cli(&temp_dir, &["delete", "docs", "--drop"])?;
    assert_success(&output, "delete --drop");
    let output = run_cli(&temp_dir, &["collections"])?;
    assert!(String::from_utf8(output.stdout)?.contains("Found 0 collections"));

    Ok(())
}

/// Test that errors are reported on stderr with a failing exit status
#[test]
fn test_cli_error_handling() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;

    let cases: [&[&str]; 5] = [
        &["search", "missing", "hello"],
        &["search", "missing"],
        &["create-collection", "docs", "--model", "no-such-model"],
        &["create-collection", "docs", "--model", "all-minilm", "--modality", "smell"],
        &["stats", "missing"],
    ];
    for args in cases {
        let output = run_cli(&temp_dir, args)?;
        assert!(!output.status.success(), "{args:?} should fail");
        let stderr = String::from_utf8(output.stderr)?;
        assert!(
            stderr.contains("Error") || stderr.contains("error"),
            "{args:?}: {stderr}"
        );
    }

    let output = run_cli(&temp_dir, &["create-collection", "docs", "--model", "all-minilm"])?;
    assert_success(&output, "create-collection");
    let output = run_cli(&temp_dir, &["create-collection", "docs", "--model", "all-minilm"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8(output.stderr)?.contains("already exists"));

    let output = run_cli(&temp_dir, &["search", "docs", "--embedding", "0.1,0.2"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8(output.stderr)?.contains("Dimension mismatch"));

    Ok(())
}
