use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn loom_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_loom"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let notes = root.join("notes");
    fs::create_dir_all(&notes).unwrap();
    fs::write(
        notes.join("alpha.md"),
        "# Alpha\n\nNotes about Rust programming, cargo and crates.",
    )
    .unwrap();
    fs::write(
        notes.join("beta.md"),
        "# Beta\n\nNotes about deployment, Kubernetes and Docker.",
    )
    .unwrap();
    fs::write(notes.join("ignored.txt"), "Not markdown.").unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[db]
path = "{}/data/loom.sqlite"

[scheduler]
workers = 2
cleanup_on_shutdown = false
"#,
        root.display()
    );
    let config_path = config_dir.join("loom.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_loom(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = loom_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .arg("--events")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run loom binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn notes_dir(config_path: &Path) -> String {
    config_path
        .parent()
        .and_then(Path::parent)
        .unwrap()
        .join("notes")
        .display()
        .to_string()
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_loom(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_loom(&config_path, &["init"]);
    assert!(success, "second init failed");
}

#[test]
fn test_add_refresh_list_file_source() {
    let (_tmp, config_path) = setup_test_env();
    run_loom(&config_path, &["init"]);

    let path = format!("path={}", notes_dir(&config_path));
    let (stdout, stderr, success) = run_loom(
        &config_path,
        &[
            "source", "add", "file", "notes", "--set", &path, "--set", "include=*.md",
            "--interval", "300",
        ],
    );
    assert!(success, "add failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Added source 1"));

    let (stdout, stderr, success) = run_loom(&config_path, &["refresh", "--all"]);
    assert!(success, "refresh failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Refreshed 1 sources"), "{}", stdout);

    let (stdout, _, success) = run_loom(&config_path, &["source", "list"]);
    assert!(success);
    assert!(stdout.contains("notes"));
    assert!(stdout.contains("file"));

    let (stdout, _, success) = run_loom(&config_path, &["articles", "1"]);
    assert!(success);
    assert!(stdout.contains("alpha.md"));
    assert!(stdout.contains("beta.md"));
    assert!(!stdout.contains("ignored.txt"));

    // A second refresh sees unchanged files and stores nothing new.
    let (_, _, success) = run_loom(&config_path, &["refresh", "--source", "1"]);
    assert!(success);
    let (stdout, _, _) = run_loom(&config_path, &["source", "info", "1"]);
    assert!(stdout.contains("articles:       2"), "{}", stdout);
}

#[test]
fn test_invalid_source_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_loom(&config_path, &["init"]);

    let (_, stderr, success) = run_loom(&config_path, &["source", "add", "web", "page"]);
    assert!(!success);
    assert!(stderr.contains("url"), "{}", stderr);

    let (_, stderr, success) = run_loom(
        &config_path,
        &["source", "add", "gopher", "old", "--set", "url=gopher://x"],
    );
    assert!(!success);
    assert!(stderr.contains("unknown adapter type 'gopher'"), "{}", stderr);

    let (stdout, _, _) = run_loom(&config_path, &["source", "list"]);
    assert!(stdout.contains("No sources configured."));
}

#[test]
fn test_filter_add_list_remove() {
    let (_tmp, config_path) = setup_test_env();
    run_loom(&config_path, &["init"]);

    let (stdout, stderr, success) = run_loom(
        &config_path,
        &["filter", "add", "keyword", "--param", "keywords=rust,cargo", "--param", "score=20"],
    );
    assert!(success, "filter add failed: {} {}", stdout, stderr);

    let (_, stderr, success) = run_loom(
        &config_path,
        &["filter", "add", "length", "--param", "score=-500", "--param", "min_length=5"],
    );
    assert!(!success, "out-of-range score must be rejected");
    assert!(stderr.contains("score"), "{}", stderr);

    let (_, stderr, success) = run_loom(&config_path, &["filter", "add", "bayes"]);
    assert!(!success);
    assert!(
        stderr.contains("Available: baseline, keyword, length"),
        "{}",
        stderr
    );

    let (stdout, _, _) = run_loom(&config_path, &["filter", "list"]);
    assert!(stdout.contains("keyword"));
    assert!(!stdout.contains("length"));

    let (_, _, success) = run_loom(&config_path, &["filter", "remove", "1"]);
    assert!(success);
    let (stdout, _, _) = run_loom(&config_path, &["filter", "list"]);
    assert!(stdout.contains("No filters configured."));
}

#[test]
fn test_mark_sets_flags_and_shows_article() {
    let (_tmp, config_path) = setup_test_env();
    run_loom(&config_path, &["init"]);
    let path = format!("path={}", notes_dir(&config_path));
    run_loom(
        &config_path,
        &["source", "add", "file", "notes", "--set", &path, "--set", "include=*.md"],
    );
    run_loom(&config_path, &["refresh", "--all"]);

    let (stdout, stderr, success) =
        run_loom(&config_path, &["mark", "1", "--read", "true", "--starred", "true"]);
    assert!(success, "mark failed: {} {}", stdout, stderr);
    assert!(stdout.contains("r*"), "{}", stdout);
    assert!(stdout.contains(".md"), "{}", stdout);

    let (_, stderr, success) = run_loom(&config_path, &["mark", "1"]);
    assert!(!success);
    assert!(stderr.contains("Nothing to change"), "{}", stderr);

    let (_, stderr, success) = run_loom(&config_path, &["mark", "999", "--read", "true"]);
    assert!(!success);
    assert!(stderr.contains("No article with id 999"), "{}", stderr);
}

#[test]
fn test_missing_config_fails_cleanly() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_loom(&tmp.path().join("absent.toml"), &["source", "list"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "{}", stderr);
}
