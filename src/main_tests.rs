//! Unit tests for the `podfleet` CLI binary implementation.
//!
//! Keeping these tests in a separate module keeps `src/main.rs` focused on
//! dispatch.

use super::*;
use podfleet::{CommandOutput, NodeReport, PodName};
use rstest::rstest;

fn completed(name: &str, exit_code: i32, lines: &[&str]) -> NodeReport {
    let mut output = CommandOutput::start("probe", 10);
    for line in lines {
        output.push_stdout(*line);
    }
    output.finish(Some(exit_code));
    NodeReport {
        id: format!("id-{name}"),
        name: PodName::parse(name),
        outcome: NodeOutcome::Completed(output),
    }
}

fn rendered(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).expect("utf8")
}

#[test]
fn validate_command_args_rejects_control_characters() {
    let err =
        validate_command_args(&[String::from("echo\tbad")]).expect_err("tab should be rejected");
    assert!(matches!(err, CliError::InvalidCommand(_)));
}

#[test]
fn validate_command_args_accepts_plain_words() {
    validate_command_args(&[String::from("python"), String::from("train.py")])
        .expect("plain arguments are accepted");
}

#[rstest]
#[case(None, "ssh -p 22 root@h")]
#[case(Some("cd work; ls"), "ssh -p 22 root@h 'cd work; ls'")]
fn ssh_invocation_quotes_remote_command(#[case] remote: Option<&str>, #[case] expected: &str) {
    assert_eq!(render_ssh_invocation("ssh -p 22 root@h", remote), expected);
}

#[test]
fn fan_out_exit_code_reflects_failures() {
    let report = FanOutReport {
        entries: vec![
            completed("grp_0", 0, &["ok"]),
            completed("grp_1", 2, &["boom"]),
        ],
    };
    let mut buf = Vec::new();

    let code = write_fan_out(&mut buf, &report).expect("write to buffer");

    assert_eq!(code, 1);
    let text = rendered(buf);
    assert!(text.contains("== grp_0 (0) ==\nok\n"));
    assert!(text.contains("== grp_1 (2) ==\nboom\n"));
}

#[test]
fn cancelled_nodes_do_not_fail_the_run() {
    let report = FanOutReport {
        entries: vec![
            completed("grp_0", 0, &[]),
            NodeReport {
                id: String::from("id-grp_1"),
                name: PodName::grouped("grp", 1),
                outcome: NodeOutcome::Cancelled,
            },
        ],
    };
    let mut buf = Vec::new();

    let code = write_fan_out(&mut buf, &report).expect("write to buffer");

    assert_eq!(code, 0);
    assert!(rendered(buf).contains("== grp_1 cancelled =="));
}

#[test]
fn sync_failures_set_exit_code() {
    let report = SyncReport {
        synced: vec![PodName::grouped("grp", 0)],
        removed: Vec::new(),
        failed: vec![(PodName::grouped("grp", 1), String::from("reset"))],
    };
    let mut buf = Vec::new();

    let code = write_sync(&mut buf, &report).expect("write to buffer");

    assert_eq!(code, 1);
    assert_eq!(rendered(buf), "synced grp_0\nfailed grp_1: reset\n");
}

#[test]
fn creation_overrides_only_apply_to_make() {
    let make = Command::Make(MakeCommand {
        count: 2,
        mem: Some(32),
        vcpu: None,
        gpus: Some(4),
        disk: None,
        image: Some(String::from("img")),
        instance_type: None,
        region: None,
        ami: None,
    });

    let overrides = creation_overrides(&make);

    assert_eq!(overrides.memory_gb, Some(32));
    assert_eq!(overrides.gpu_count, Some(4));
    assert_eq!(overrides.image.as_deref(), Some("img"));
    assert_eq!(creation_overrides(&Command::Sync), ResourceOverrides::default());
}

#[test]
fn write_error_writes_cli_error() {
    let mut buf = Vec::new();
    let err = CliError::Fleet(String::from("listing instances failed after 3 attempts"));
    write_error(&mut buf, &err);
    assert_eq!(
        rendered(buf),
        "fleet error: listing instances failed after 3 attempts\n"
    );
}
