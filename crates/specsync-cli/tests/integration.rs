use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn specsync(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("specsync").unwrap();
    cmd.current_dir(dir.path()).env("SPECSYNC_ROOT", dir.path());
    cmd
}

fn init_project(dir: &TempDir) {
    specsync(dir).arg("init").assert().success();
}

fn sync_project(dir: &TempDir) {
    specsync(dir).arg("sync").assert().success();
}

// ---------------------------------------------------------------------------
// specsync init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_manifest_and_example() {
    let dir = TempDir::new().unwrap();
    specsync(&dir).arg("init").assert().success();

    assert!(dir.path().join("specsync.yaml").exists());
    assert!(dir.path().join("specs/commands.ttl").exists());
    assert!(dir.path().join("shapes/commands.yaml").exists());
    assert!(dir.path().join("queries/commands.rq").exists());
    assert!(dir.path().join("templates/commands.md.tera").exists());
    assert!(dir.path().join("docs").is_dir());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    specsync(&dir).arg("init").assert().success();
    specsync(&dir).arg("init").assert().success();
}

#[test]
fn init_does_not_clobber_user_edits() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(dir.path().join("specs/commands.ttl"), "# mine\n").unwrap();
    specsync(&dir).arg("init").assert().success();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("specs/commands.ttl")).unwrap(),
        "# mine\n"
    );
}

// ---------------------------------------------------------------------------
// specsync sync
// ---------------------------------------------------------------------------

#[test]
fn sync_generates_artifact_and_receipt() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    specsync(&dir)
        .arg("sync")
        .assert()
        .success()
        .stdout(predicate::str::contains("commands: updated"));

    let output = std::fs::read_to_string(dir.path().join("docs/commands.md")).unwrap();
    assert!(output.starts_with("<!-- generated by specsync from graph "));
    assert!(output.contains("## hello"));
    assert!(output.contains("Print a friendly greeting"));
    assert!(output.contains("## version"));
    assert!(output.contains("Undocumented."));
    assert!(output.ends_with('\n'));

    let receipt: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("docs/commands.md.receipt.json")).unwrap(),
    )
    .unwrap();
    for key in ["graph_digest", "query_digest", "template_digest", "output_digest"] {
        let digest = receipt[key].as_str().unwrap();
        assert_eq!(digest.len(), 64, "{key} should be a sha-256 hex digest");
    }
    assert_eq!(receipt["stages"].as_array().unwrap().len(), 5);
}

#[test]
fn sync_twice_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    sync_project(&dir);
    let first = std::fs::read(dir.path().join("docs/commands.md")).unwrap();
    let first_receipt: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("docs/commands.md.receipt.json")).unwrap(),
    )
    .unwrap();

    specsync(&dir)
        .arg("sync")
        .assert()
        .success()
        .stdout(predicate::str::contains("commands: unchanged"));
    let second = std::fs::read(dir.path().join("docs/commands.md")).unwrap();
    let second_receipt: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("docs/commands.md.receipt.json")).unwrap(),
    )
    .unwrap();

    assert_eq!(first, second);
    assert_eq!(first_receipt["output_digest"], second_receipt["output_digest"]);
    assert_eq!(first_receipt["graph_digest"], second_receipt["graph_digest"]);
    // Run metadata differs per run by design.
    assert_ne!(first_receipt["run_id"], second_receipt["run_id"]);
}

#[test]
fn sync_dry_run_writes_nothing() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    specsync(&dir)
        .args(["sync", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("would update"));

    assert!(!dir.path().join("docs/commands.md").exists());
    assert!(!dir.path().join("docs/commands.md.receipt.json").exists());
}

#[test]
fn sync_unknown_transform_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    specsync(&dir)
        .args(["sync", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("transform not found: nope"));
}

#[test]
fn sync_without_init_fails() {
    let dir = TempDir::new().unwrap();
    specsync(&dir)
        .arg("sync")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn sync_reports_every_shape_violation() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    // Two commands, both missing their required label.
    std::fs::write(
        dir.path().join("specs/commands.ttl"),
        "@prefix ex: <http://example.org/spec#> .\n\
         ex:a a ex:Command .\n\
         ex:b a ex:Command .\n",
    )
    .unwrap();

    specsync(&dir)
        .arg("sync")
        .assert()
        .failure()
        .stderr(
            predicate::str::contains("normalize stage failed")
                .and(predicate::str::contains("2 shape violation(s)"))
                .and(predicate::str::contains("spec#a"))
                .and(predicate::str::contains("spec#b")),
        );
    assert!(!dir.path().join("docs/commands.md").exists());
}

#[test]
fn sync_fails_fast_on_undefined_template_variable() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join("templates/commands.md.tera"),
        "{% for cmd in rows %}{{ cmd.description }}{% endfor %}",
    )
    .unwrap();

    specsync(&dir)
        .arg("sync")
        .assert()
        .failure()
        .stderr(
            predicate::str::contains("emit stage failed")
                .and(predicate::str::contains("cmd.description")),
        );
    assert!(!dir.path().join("docs/commands.md").exists());
    assert!(!dir.path().join("docs/commands.md.receipt.json").exists());
}

#[test]
fn sync_graph_syntax_error_names_file_and_line() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join("specs/commands.ttl"),
        "@prefix ex: <http://example.org/spec#> .\nex:a ex:label \"unterminated .\n",
    )
    .unwrap();

    specsync(&dir)
        .arg("sync")
        .assert()
        .failure()
        .stderr(predicate::str::contains("commands.ttl"));
}

#[test]
fn sync_json_output() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let assert = specsync(&dir).args(["sync", "--json"]).assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["failures"], 0);
    assert_eq!(value["synced"][0]["name"], "commands");
    assert_eq!(value["synced"][0]["changed"], true);
}

// ---------------------------------------------------------------------------
// specsync list / validate
// ---------------------------------------------------------------------------

#[test]
fn list_shows_transforms() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    specsync(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("commands")
                .and(predicate::str::contains("docs/commands.md")),
        );
}

#[test]
fn validate_clean_project_passes() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    specsync(&dir)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("No warnings"));
}

#[test]
fn validate_missing_input_is_an_error() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::remove_file(dir.path().join("specs/commands.ttl")).unwrap();

    specsync(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stdout(predicate::str::contains("missing file"));
}

// ---------------------------------------------------------------------------
// specsync verify
// ---------------------------------------------------------------------------

#[test]
fn verify_before_sync_reports_missing_output() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    specsync(&dir)
        .arg("verify")
        .assert()
        .failure()
        .stdout(predicate::str::contains("missing output"));
}

#[test]
fn verify_after_sync_passes() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    sync_project(&dir);

    specsync(&dir)
        .arg("verify")
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn verify_flags_hand_edited_artifact() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    sync_project(&dir);
    let path = dir.path().join("docs/commands.md");
    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("hand edit\n");
    std::fs::write(&path, content).unwrap();

    specsync(&dir)
        .arg("verify")
        .assert()
        .failure()
        .stdout(predicate::str::contains("stale").and(predicate::str::contains("output")))
        .stderr(predicate::str::contains("out of sync"));
}

#[test]
fn verify_flags_edited_source_graph() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    sync_project(&dir);
    std::fs::write(
        dir.path().join("specs/commands.ttl"),
        "@prefix ex: <http://example.org/spec#> .\n\
         ex:hello a ex:Command ; ex:label \"renamed\" .\n",
    )
    .unwrap();

    specsync(&dir)
        .arg("verify")
        .assert()
        .failure()
        .stdout(predicate::str::contains("stale").and(predicate::str::contains("graph")));
}
