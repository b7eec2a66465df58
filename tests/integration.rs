use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn prag_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("prag");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(files_dir.join("ignored.rs"), "fn main() {}").unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/prag.sqlite"

[splitter]
chunk_size = 80
chunk_overlap = 10

[embedding]
provider = "mock"
dims = 64

[llm]
provider = "mock"

[retrieval]
top_k = 3
"#,
        root.display()
    );

    let config_path = config_dir.join("prag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn files_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("files")
}

fn run_prag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = prag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run prag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn ingest_files(config_path: &Path) -> String {
    let dir = files_dir(config_path);
    let (stdout, stderr, success) = run_prag(config_path, &["ingest", dir.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

/// Document ids from `prag list`, in listing order.
fn listed_ids(config_path: &Path) -> Vec<String> {
    let (stdout, _, success) = run_prag(config_path, &["list"]);
    assert!(success);
    stdout
        .lines()
        .filter(|l| !l.starts_with(' ') && !l.is_empty())
        .filter_map(|l| l.split_whitespace().next().map(str::to_string))
        .collect()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_prag(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_prag(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_prag(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_folder() {
    let (_tmp, config_path) = setup_test_env();

    let stdout = ingest_files(&config_path);
    assert!(stdout.contains("files loaded: 3"));
    assert!(stdout.contains("failed: 0"));
    assert!(stdout.contains("ok"));
    assert!(!stdout.contains("ignored.rs"));
}

#[test]
fn test_reingest_does_not_duplicate() {
    let (_tmp, config_path) = setup_test_env();

    ingest_files(&config_path);
    let first = listed_ids(&config_path);
    ingest_files(&config_path);
    let second = listed_ids(&config_path);

    assert_eq!(first.len(), 3);
    let mut a = first.clone();
    let mut b = second.clone();
    a.sort();
    b.sort();
    assert_eq!(a, b);
}

#[test]
fn test_list_survives_restart() {
    let (_tmp, config_path) = setup_test_env();

    ingest_files(&config_path);
    let (stdout, _, success) = run_prag(&config_path, &["list"]);
    assert!(success);
    assert!(stdout.contains("Completed"));
    assert!(stdout.contains("alpha.md"));
    assert!(stdout.contains("gamma.txt"));
}

#[test]
fn test_ingest_missing_path_errors() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_prag(&config_path, &["ingest", "/nonexistent/prag/path"]);
    assert!(!success);
    assert!(stderr.contains("does not exist"));
}

#[test]
fn test_ingest_text_then_delete() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_prag(
        &config_path,
        &["ingest-text", "note.txt", "A short note about sqlite vectors."],
    );
    assert!(success, "ingest-text failed: {}", stderr);
    let doc_id = stdout
        .lines()
        .find_map(|l| l.strip_prefix("ingested "))
        .unwrap()
        .trim()
        .to_string();

    let (stdout, _, success) = run_prag(&config_path, &["delete", &doc_id]);
    assert!(success);
    assert!(stdout.contains("deleted"));
    assert!(stdout.contains("(1 nodes)"));

    let (stdout, _, _) = run_prag(&config_path, &["list"]);
    assert!(stdout.contains("No documents."));

    // Deleting again is a no-op.
    let (stdout, _, success) = run_prag(&config_path, &["delete", &doc_id]);
    assert!(success);
    assert!(stdout.contains("(0 nodes)"));
}

#[test]
fn test_wipe_removes_everything() {
    let (_tmp, config_path) = setup_test_env();

    ingest_files(&config_path);
    let (stdout, _, success) = run_prag(&config_path, &["wipe"]);
    assert!(success);
    assert!(stdout.contains("wiped 3 documents"));

    let (stdout, _, _) = run_prag(&config_path, &["retrieve", "rust"]);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_retrieve_returns_ranked_chunks() {
    let (_tmp, config_path) = setup_test_env();

    ingest_files(&config_path);
    let (stdout, stderr, success) =
        run_prag(&config_path, &["retrieve", "Kubernetes and Docker deployment"]);
    assert!(success, "retrieve failed: {}", stderr);
    assert!(stdout.contains("1. ["));
    assert!(stdout.contains("gamma.txt"));
    assert!(!stdout.contains("4. ["), "top_k=3 must cap results");
}

#[test]
fn test_retrieve_deterministic() {
    let (_tmp, config_path) = setup_test_env();

    ingest_files(&config_path);
    let (a, _, _) = run_prag(&config_path, &["retrieve", "machine learning"]);
    let (b, _, _) = run_prag(&config_path, &["retrieve", "machine learning"]);
    assert_eq!(a, b);
}

#[test]
fn test_retrieve_zero_top_k_errors() {
    let (_tmp, config_path) = setup_test_env();

    ingest_files(&config_path);
    let (_, stderr, success) = run_prag(&config_path, &["retrieve", "rust", "--top-k", "0"]);
    assert!(!success);
    assert!(stderr.contains("top_k"));
}

#[test]
fn test_chat_cites_sources() {
    let (_tmp, config_path) = setup_test_env();

    ingest_files(&config_path);
    let (stdout, stderr, success) = run_prag(&config_path, &["chat", "What about Rust?"]);
    assert!(success, "chat failed: {}", stderr);
    assert!(stdout.contains("You asked: What about Rust?"));
    assert!(stdout.contains("sources:"));
}

#[test]
fn test_chat_stream_without_context() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_prag(
        &config_path,
        &["chat", "Hello there", "--no-context", "--stream"],
    );
    assert!(success, "chat failed: {}", stderr);
    assert!(stdout.contains("You asked: Hello there."));
    assert!(!stdout.contains("sources:"));
}

#[test]
fn test_missing_config_errors() {
    let (_, stderr, success) = run_prag(Path::new("/nonexistent/prag.toml"), &["list"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
