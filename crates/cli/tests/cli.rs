use assert_cmd::Command;
use predicates::prelude::*;

fn dropline() -> Command {
    let mut cmd = Command::cargo_bin("dropline").unwrap();
    cmd.env_remove("DROPLINE_TOKEN").env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_commands() {
    dropline()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("upload"))
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("share"))
        .stdout(predicate::str::contains("link-info"));
}

#[test]
fn upload_requires_paths() {
    dropline()
        .arg("upload")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<PATHS>"));
}

#[test]
fn config_path_honours_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.toml");

    dropline()
        .args(["config", "path", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("custom.toml"));
}

#[test]
fn missing_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();

    dropline()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .args(["share", "/Docs/a.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration not found"));
}

#[test]
fn config_show_masks_token() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[auth]\ntoken = \"sl.very-secret-token\"\n\n[upload]\nmode = \"overwrite\"\n",
    )
    .unwrap();

    dropline()
        .arg("--config")
        .arg(&path)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sl.ver..."))
        .stdout(predicate::str::contains("very-secret").not())
        .stdout(predicate::str::contains("Mode: overwrite"));
}

#[test]
fn unsupported_shell_is_rejected() {
    dropline()
        .args(["completion", "tcsh"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unsupported shell"));
}
