#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const MILLFILE: &str = r#"
default = "b"

[tasks.a]
desc = "Produce out/a"
outputs = ["out/a"]
run = ["mkdir -p out", "echo a > out/a"]

[tasks.b]
desc = "Copy out/a to out/b"
inputs = ["out/a"]
outputs = ["out/b"]
run = ["cat out/a > out/b"]

[tasks.greet]
vars.name = "world"
run = ["echo hello ${name} > greeting.txt"]

[tasks."gen:docs"]
desc = "Generated task"

[tasks.broken]
run = ["exit 7"]

[tasks.after-broken]
depends = ["broken"]
run = ["touch after.txt"]
"#;

fn project(millfile: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Millfile.toml"), millfile).unwrap();
    dir
}

fn mill(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("mill").unwrap();
    cmd.current_dir(dir).arg("--no-color").env_remove("MILL_FILE").env_remove("MILL_JOBS");
    cmd
}

fn bump_mtime(path: &Path) {
    let file = fs::OpenOptions::new().append(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(10)).unwrap();
}

#[test]
fn list_hides_generated_tasks() {
    let dir = project(MILLFILE);

    mill(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Copy out/a to out/b"))
        .stdout(predicate::str::contains("(default)"))
        .stdout(predicate::str::contains("gen:docs").not());

    mill(dir.path())
        .args(["list", "--all", "--format", "plain"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("b\n"))
        .stdout(predicate::str::contains("gen:docs"));
}

#[test]
fn rebuilds_only_what_is_stale() {
    let dir = project(MILLFILE);

    mill(dir.path())
        .arg("b")
        .assert()
        .success()
        .stdout(predicate::str::contains("[run] a"))
        .stdout(predicate::str::contains("[run] b"));
    assert_eq!(fs::read_to_string(dir.path().join("out/b")).unwrap(), "a\n");

    mill(dir.path())
        .arg("b")
        .assert()
        .success()
        .stdout(predicate::str::contains("[skip] a"))
        .stdout(predicate::str::contains("[skip] b"));

    bump_mtime(&dir.path().join("out/a"));

    mill(dir.path())
        .arg("b")
        .assert()
        .success()
        .stdout(predicate::str::contains("[skip] a"))
        .stdout(predicate::str::contains("[run] b"));
}

#[test]
fn default_task_runs_without_target() {
    let dir = project(MILLFILE);

    mill(dir.path()).assert().success();
    assert!(dir.path().join("out/b").exists());
}

#[test]
fn output_path_is_a_target() {
    let dir = project(MILLFILE);

    mill(dir.path())
        .args(["run", "out/a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[run] a"));
    assert!(!dir.path().join("out/b").exists());
}

#[test]
fn force_reruns_everything() {
    let dir = project(MILLFILE);

    mill(dir.path()).arg("b").assert().success();
    mill(dir.path())
        .args(["-B", "b"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[run] a"))
        .stdout(predicate::str::contains("[run] b"));
}

#[test]
fn redo_forces_target_and_dependents() {
    let dir = project(MILLFILE);

    mill(dir.path()).arg("b").assert().success();
    mill(dir.path())
        .args(["redo", "a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[run] a"))
        .stdout(predicate::str::contains("[run] b"));

    mill(dir.path())
        .args(["redo", "a", "--only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[run] a"))
        .stdout(predicate::str::contains("[run] b").not());
}

#[test]
fn vars_override_default() {
    let dir = project(MILLFILE);

    mill(dir.path()).arg("greet").assert().success();
    assert_eq!(
        fs::read_to_string(dir.path().join("greeting.txt")).unwrap(),
        "hello world\n"
    );

    mill(dir.path())
        .args(["greet", "--vars", "greet.name=mill"])
        .assert()
        .success();
    assert_eq!(
        fs::read_to_string(dir.path().join("greeting.txt")).unwrap(),
        "hello mill\n"
    );
}

#[test]
fn vars_file_section() {
    let dir = project(MILLFILE);
    fs::write(dir.path().join("vars.toml"), "[greet]\nname = \"file\"\n").unwrap();

    mill(dir.path())
        .args(["greet", "--vars-file", "vars.toml"])
        .assert()
        .success();
    assert_eq!(
        fs::read_to_string(dir.path().join("greeting.txt")).unwrap(),
        "hello file\n"
    );
}

#[test]
fn unknown_var_fails() {
    let dir = project(MILLFILE);

    mill(dir.path())
        .args(["greet", "--vars", "greet.nope=1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown var 'nope'"));
}

#[test]
fn failing_task_stops_run() {
    let dir = project(MILLFILE);

    mill(dir.path())
        .arg("after-broken")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Task 'broken' failed"));
    assert!(!dir.path().join("after.txt").exists());
}

#[test]
fn parallel_run_succeeds() {
    let dir = project(MILLFILE);

    mill(dir.path())
        .args(["-j", "2", "b", "greet"])
        .assert()
        .success();
    assert!(dir.path().join("out/b").exists());
    assert!(dir.path().join("greeting.txt").exists());
}

#[test]
fn unknown_target_fails() {
    let dir = project(MILLFILE);

    mill(dir.path())
        .arg("nope")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown task 'nope'"));
}

#[test]
fn dry_run_changes_nothing() {
    let dir = project(MILLFILE);

    mill(dir.path())
        .args(["run", "b", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("missing output"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn graph_formats() {
    let dir = project(MILLFILE);

    mill(dir.path())
        .args(["graph", "b", "--format", "dot"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"a\" -> \"b\";"));

    mill(dir.path())
        .args(["graph", "b", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"edges\""));
}

#[test]
fn which_shows_tree() {
    let dir = project(MILLFILE);

    mill(dir.path())
        .args(["which", "b"])
        .assert()
        .success()
        .stdout(predicate::str::contains("b\n  a\n"));

    mill(dir.path())
        .args(["which", "a", "--dependents"])
        .assert()
        .success()
        .stdout(predicate::str::contains("  b"));
}

#[test]
fn clean_removes_outputs() {
    let dir = project(MILLFILE);
    mill(dir.path()).arg("b").assert().success();

    mill(dir.path())
        .args(["clean", "b", "--up", "--dry"])
        .assert()
        .success()
        .stdout(predicate::str::contains("would remove out/a"));
    assert!(dir.path().join("out/a").exists());

    mill(dir.path()).args(["clean", "b"]).assert().success();
    assert!(!dir.path().join("out/b").exists());
    assert!(dir.path().join("out/a").exists());

    mill(dir.path()).args(["clean", "--all"]).assert().success();
    assert!(!dir.path().join("out/a").exists());
}

#[test]
fn doctor_reports_cycles() {
    let dir = project(
        r#"
        [tasks.x]
        depends = ["y"]

        [tasks.y]
        depends = ["x"]
    "#,
    );

    mill(dir.path())
        .arg("doctor")
        .assert()
        .failure()
        .stdout(predicate::str::contains("dependency cycle"));

    mill(dir.path())
        .arg("x")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn doctor_reports_missing_inputs() {
    let dir = project(
        r#"
        [tasks.compile]
        inputs = ["src/main.c"]
        outputs = ["app"]
    "#,
    );

    mill(dir.path())
        .arg("doctor")
        .assert()
        .failure()
        .stdout(predicate::str::contains("src/main.c"));
}

#[test]
fn missing_task_file() {
    let dir = tempfile::tempdir().unwrap();

    mill(dir.path())
        .args(["--file", "Nope.toml", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Task file not found"));
}
