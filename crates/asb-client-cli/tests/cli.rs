//! Binary-level tests for the asb-client command.

use assert_cmd::Command;
use predicates::prelude::*;

fn asb_client() -> Command {
    let mut cmd = Command::cargo_bin("asb-client").unwrap();
    cmd.env_clear().env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_help_lists_commands() {
    asb_client()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("send"))
        .stdout(predicate::str::contains("receive"))
        .stdout(predicate::str::contains("demo"));
}

#[test]
fn test_missing_configuration_exits_with_configuration_code() {
    asb_client()
        .args(["send", "stuff"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("namespace"));
}

#[test]
fn test_missing_path_exits_with_argument_code() {
    asb_client()
        .args(["--emulator", "demo"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("path"));
}

#[test]
fn test_emulator_is_rejected_for_send() {
    asb_client()
        .args(["--emulator", "send", "stuff"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("emulator"));
}

#[test]
fn test_config_shows_redacted_identity() {
    asb_client()
        .env("ASB_NAMESPACE", "tester")
        .env("ASB_KEY_NAME", "Root")
        .env("ASB_KEY", "super-secret")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("https://tester.servicebus.windows.net:443/"))
        .stdout(predicate::str::contains("super-secret").not());
}

#[test]
fn test_emulator_demo_completes() {
    asb_client()
        .args([
            "--emulator",
            "demo",
            "stuff",
            "--messages",
            "2",
            "--send-interval-ms",
            "5",
            "--receive-interval-ms",
            "5",
        ])
        .assert()
        .success();
}
