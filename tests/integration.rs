use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn pmo_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_pmo"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let ws = root.join("ws");

    fs::create_dir_all(ws.join("projects")).unwrap();
    fs::create_dir_all(ws.join("risks")).unwrap();
    fs::create_dir_all(ws.join("decisions")).unwrap();

    fs::write(
        ws.join("projects/apollo.md"),
        "---\nid: apollo\ntitle: Apollo Launch\nowner: dana\nstatus: active\n---\n# Apollo Launch\n\nShip the lander. See decision:use-rust.\n\n## Milestones\n- beta\n",
    )
    .unwrap();
    fs::write(
        ws.join("risks/vendor-delay.md"),
        "---\nid: vendor-delay\nseverity: high\nstatus: open\nproject: project:apollo\n---\nThe vendor may slip the antenna delivery.\n",
    )
    .unwrap();
    fs::write(ws.join("risks/a.md"), "---\nid: risk:dup\nseverity: low\nstatus: open\n---\n").unwrap();
    fs::write(ws.join("risks/b.md"), "---\nid: risk:dup\nseverity: low\nstatus: open\n---\n").unwrap();
    fs::write(ws.join("decisions/adr-7.md"), "# Use Postgres\n\nNo front matter here.\n").unwrap();

    let config_content = format!(
        r#"[workspace]
root = "{ws}"
include_globs = ["**/*.md"]

[db]
path = "{root}/data/pmo.sqlite"

[watch]
debounce_ms = 100
max_wait_ms = 1000

[retrieval]
final_limit = 5

[server]
bind = "127.0.0.1:7391"
"#,
        ws = ws.display(),
        root = root.display()
    );

    let config_path = root.join("pmo.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_pmo(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = pmo_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run pmo binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn reconciled_env() -> (TempDir, PathBuf) {
    let (tmp, config) = setup_test_env();
    let (_, stderr, ok) = run_pmo(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    let (_, stderr, ok) = run_pmo(&config, &["reconcile"]);
    assert!(ok, "reconcile failed: {}", stderr);
    (tmp, config)
}

#[test]
fn test_init_creates_typed_directories() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_pmo(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Index initialized"));

    let ws = tmp.path().join("ws");
    for dir in ["projects", "epics", "decisions", "risks", "meetings", "people", "logs"] {
        assert!(ws.join(dir).is_dir(), "missing {}", dir);
    }
    assert!(tmp.path().join("data/pmo.sqlite").exists());

    // Idempotent.
    let (_, stderr, ok) = run_pmo(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_reconcile_reports_counts() {
    let (_tmp, config) = setup_test_env();
    run_pmo(&config, &["init"]);

    let (stdout, stderr, ok) = run_pmo(&config, &["reconcile"]);
    assert!(ok, "reconcile failed: {}", stderr);
    assert!(stdout.contains("Reconciled 5 path(s): 5 indexed"), "{}", stdout);
    assert!(stdout.contains("1 conflict(s)"), "{}", stdout);

    let (stdout, _, ok) = run_pmo(&config, &["reconcile"]);
    assert!(ok);
    assert!(stdout.contains("0 indexed, 5 unchanged"), "{}", stdout);
}

#[test]
fn test_list_filters() {
    let (_tmp, config) = reconciled_env();

    let (stdout, _, ok) = run_pmo(&config, &["list", "--type", "risk"]);
    assert!(ok);
    assert!(stdout.contains("3 document(s)"), "{}", stdout);

    let (stdout, _, ok) = run_pmo(&config, &["list", "--owner", "dana"]);
    assert!(ok);
    assert!(stdout.contains("projects/apollo.md"));
    assert!(!stdout.contains("risks/"));

    let (stdout, _, ok) = run_pmo(&config, &["list", "--meta", "severity=high"]);
    assert!(ok);
    assert!(stdout.contains("risks/vendor-delay.md"));
    assert!(!stdout.contains("risks/a.md"));

    let (_, stderr, ok) = run_pmo(&config, &["list", "--type", "widget"]);
    assert!(!ok);
    assert!(stderr.contains("widget"));
}

#[test]
fn test_get_shows_references_and_fallback_id() {
    let (_tmp, config) = reconciled_env();

    let (stdout, _, ok) = run_pmo(&config, &["get", "risks/vendor-delay.md"]);
    assert!(ok);
    assert!(stdout.contains("id:           vendor-delay"));
    assert!(stdout.contains("project:apollo -> projects/apollo.md"));

    let (stdout, _, ok) = run_pmo(&config, &["get", "decisions/adr-7.md"]);
    assert!(ok);
    assert!(stdout.contains("id:           decision:adr-7"));
    assert!(stdout.contains("title:        Use Postgres"));

    let (stdout, _, ok) = run_pmo(&config, &["id", "project", "apollo"]);
    assert!(ok);
    assert!(stdout.contains("--- Backlinks (1) ---"));
    assert!(stdout.contains("risks/vendor-delay.md"));
    assert!(stdout.contains("decision:use-rust (dangling)"));
}

#[test]
fn test_search_keyword_and_disabled_semantic() {
    let (_tmp, config) = reconciled_env();

    let (stdout, _, ok) = run_pmo(&config, &["search", "antenna"]);
    assert!(ok);
    assert!(stdout.contains("risks/vendor-delay.md"));

    let (stdout, _, ok) = run_pmo(&config, &["search", "zeppelin"]);
    assert!(ok);
    assert!(stdout.contains("No results."));

    let (_, stderr, ok) = run_pmo(&config, &["search", "antenna", "--mode", "hybrid"]);
    assert!(!ok);
    assert!(stderr.contains("embedding provider is disabled"));
}

#[test]
fn test_diagnostics_lists_collision_and_dangling() {
    let (_tmp, config) = reconciled_env();

    let (stdout, _, ok) = run_pmo(&config, &["diagnostics"]);
    assert!(ok);
    assert!(stdout.contains("--- Identifier collisions (1) ---"));
    assert!(stdout.contains("owned by risks/a.md, also claimed by risks/b.md"));
    assert!(stdout.contains("projects/apollo.md -> decision:use-rust"));

    let (stdout, _, ok) = run_pmo(&config, &["stats"]);
    assert!(ok);
    assert!(stdout.contains("Documents:   5"));
    assert!(stdout.contains("Conflicts:   1"));
}

#[test]
fn test_apply_from_stdin_with_backup() {
    let (tmp, config) = reconciled_env();
    let target = tmp.path().join("ws/risks/vendor-delay.md");
    let original = fs::read_to_string(&target).unwrap();
    let patched = original.replace("severity: high", "severity: critical");

    let mut child = Command::new(pmo_binary())
        .arg("--config")
        .arg(config.to_str().unwrap())
        .args(["apply", "risks/vendor-delay.md", "-", "--backup"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(patched.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "apply failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    assert_eq!(fs::read_to_string(&target).unwrap(), patched);
    assert_eq!(
        fs::read_to_string(tmp.path().join("ws/risks/vendor-delay.md.bak")).unwrap(),
        original
    );

    let (stdout, _, ok) = run_pmo(&config, &["list", "--meta", "severity=critical"]);
    assert!(ok);
    assert!(stdout.contains("risks/vendor-delay.md"));

    let (_, stderr, ok) = run_pmo(&config, &["apply", "../escape.md", "-"]);
    assert!(!ok);
    assert!(!stderr.is_empty());
}

#[test]
fn test_missing_explicit_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run_pmo(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!ok);
    assert!(stderr.contains("Config file not found"));
}
