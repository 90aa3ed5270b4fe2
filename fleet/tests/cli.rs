use predicates::prelude::*;

fn sshfleet() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("sshfleet").unwrap()
}

#[test]
fn check_sshfleet_help() {
    sshfleet().arg("--help").assert().success();
    sshfleet().args(["put-tree", "--help"]).assert().success();
}

#[test]
fn missing_host_file_is_a_setup_error() {
    let tmp_dir = tempfile::tempdir().unwrap();
    sshfleet()
        .arg("--hosts")
        .arg(tmp_dir.path().join("absent.json"))
        .args(["run", "true"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("failed reading host file"));
}

#[test]
fn empty_host_list_is_a_setup_error() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let hosts = tmp_dir.path().join("hosts.json");
    std::fs::write(&hosts, "[]").unwrap();
    sshfleet()
        .arg("--hosts")
        .arg(&hosts)
        .args(["run", "true"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("lists no hosts"));
}

#[test]
fn conflicting_credentials_are_rejected() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let hosts = tmp_dir.path().join("hosts.json");
    std::fs::write(
        &hosts,
        r#"[{"hostname": "web1", "username": "ops", "password": "x", "key_filename": "/k"}]"#,
    )
    .unwrap();
    sshfleet()
        .arg("--hosts")
        .arg(&hosts)
        .args(["--quiet", "run", "true"])
        .assert()
        .code(2)
        .stderr(predicate::str::is_empty());
}

#[test]
fn get_of_non_file_path_fails_before_connecting() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let hosts = tmp_dir.path().join("hosts.json");
    std::fs::write(&hosts, r#"[{"hostname": "web1.invalid", "username": "ops"}]"#).unwrap();
    sshfleet()
        .arg("--hosts")
        .arg(&hosts)
        .args(["get", "/"])
        .arg(tmp_dir.path().join("out"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("does not name a file"))
        .stderr(predicate::str::contains("failed to connect").not());
}

#[test]
fn invalid_env_is_a_usage_error() {
    sshfleet()
        .args(["--hosts", "hosts.json", "run", "--env", "NOEQUALS", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));
}
