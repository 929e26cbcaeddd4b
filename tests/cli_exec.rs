//! Behavioural tests for the `skiff exec` CLI.

use assert_cmd::Command;
use predicates::str::contains;

fn skiff_cmd() -> Command {
    Command::cargo_bin("skiff").expect("binary should be built")
}

#[test]
fn cli_exec_propagates_exit_code_and_streams_output() {
    let mut cmd = skiff_cmd();
    cmd.env("SKIFF_FAKE_MODE", "exec-exit-7");
    cmd.args(["exec", "dev1", "--", "echo", "ok"]);

    cmd.assert()
        .code(7)
        .stdout(contains("fake-stdout"))
        .stderr(contains("fake-stderr"));
}

#[test]
fn cli_exec_reports_success_exit_code() {
    let mut cmd = skiff_cmd();
    cmd.env("SKIFF_FAKE_MODE", "exec-exit-0");
    cmd.args(["exec", "dev1", "--", "echo", "ok"]);

    cmd.assert().success().stdout(contains("fake-stdout"));
}

#[test]
fn cli_exec_reports_missing_exit_code() {
    let mut cmd = skiff_cmd();
    cmd.env("SKIFF_FAKE_MODE", "missing-exit");
    cmd.args(["exec", "dev1", "--", "echo", "ok"]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("remote command terminated without an exit status"));
}

#[test]
fn cli_without_arguments_prints_help() {
    let mut cmd = skiff_cmd();
    cmd.assert()
        .failure()
        .stderr(contains("Provision disposable cloud sandboxes"));
}
