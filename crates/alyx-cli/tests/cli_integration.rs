use assert_cmd::Command;
use predicates::prelude::*;

const TASKS_V1: &str = r#"
version: 1
collections:
  - name: tasks
    fields:
      - name: title
        type: string
"#;

const TASKS_V2: &str = r#"
version: 1
collections:
  - name: tasks
    fields:
      - name: title
        type: string
      - name: priority
        type: int
        default:
          literal: 0
"#;

fn write(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn config(dir: &std::path::Path) -> std::path::PathBuf {
    write(
        dir,
        "alyx.toml",
        &format!(
            "[database]\npath = \"{}\"\n",
            dir.join("alyx.db").display()
        ),
    )
}

#[test]
fn validate_accepts_good_schema() {
    let dir = tempfile::tempdir().unwrap();
    let schema = write(dir.path(), "schema.yaml", TASKS_V1);

    Command::cargo_bin("alyx")
        .unwrap()
        .args(["validate", schema.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 collection(s)"));
}

#[test]
fn validate_rejects_bad_rule() {
    let dir = tempfile::tempdir().unwrap();
    let schema = write(
        dir.path(),
        "schema.yaml",
        r#"
version: 1
collections:
  - name: posts
    fields:
      - name: title
        type: string
    rules:
      read: 'doc.title =='
"#,
    );

    Command::cargo_bin("alyx")
        .unwrap()
        .args(["validate", schema.to_str().unwrap()])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("posts"));
}

#[test]
fn diff_reports_safety() {
    let dir = tempfile::tempdir().unwrap();
    let old = write(dir.path(), "old.yaml", TASKS_V1);
    let new = write(dir.path(), "new.yaml", TASKS_V2);

    Command::cargo_bin("alyx")
        .unwrap()
        .args(["diff", old.to_str().unwrap(), new.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("ADD field 'tasks.priority'"))
        .stdout(predicate::str::contains("[safe]"));
}

#[test]
fn deploy_then_rollback_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let v1 = write(dir.path(), "v1.yaml", TASKS_V1);
    let v2 = write(dir.path(), "v2.yaml", TASKS_V2);

    Command::cargo_bin("alyx")
        .unwrap()
        .args([
            "--config",
            config.to_str().unwrap(),
            "deploy",
            v1.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("deployed v1"));

    Command::cargo_bin("alyx")
        .unwrap()
        .args([
            "--config",
            config.to_str().unwrap(),
            "deploy",
            v2.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("deployed v2"));

    Command::cargo_bin("alyx")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "rollback", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rolled back to v1"));
}

#[test]
fn deploy_refuses_unsafe_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let v1 = write(dir.path(), "v1.yaml", TASKS_V1);
    let narrowed = write(
        dir.path(),
        "narrowed.yaml",
        r#"
version: 1
collections:
  - name: tasks
    fields:
      - name: title
        type: int
"#,
    );

    Command::cargo_bin("alyx")
        .unwrap()
        .args([
            "--config",
            config.to_str().unwrap(),
            "deploy",
            v1.to_str().unwrap(),
        ])
        .assert()
        .success();

    Command::cargo_bin("alyx")
        .unwrap()
        .args([
            "--config",
            config.to_str().unwrap(),
            "deploy",
            narrowed.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("CHANGE TYPE"));
}

#[test]
fn migrate_applies_pending_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let migrations = dir.path().join("migrations");
    std::fs::create_dir_all(&migrations).unwrap();
    std::fs::write(
        migrations.join("0001_widgets.sql"),
        "-- alyx:up\nCREATE TABLE widgets (id TEXT);\n-- alyx:down\nDROP TABLE widgets;\n",
    )
    .unwrap();

    Command::cargo_bin("alyx")
        .unwrap()
        .args([
            "--config",
            config.to_str().unwrap(),
            "migrate",
            "--migrations-dir",
            migrations.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 migration(s) applied"));
}
