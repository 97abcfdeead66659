//! Unit tests for SSH argument building and workspace inspection.

use std::fs;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::endpoint;

struct Workspace {
    _dir: TempDir,
    path: Utf8PathBuf,
}

impl Workspace {
    fn write(&self, name: &str, contents: &str) {
        fs::write(self.path.join(name), contents).expect("write workspace file");
    }
}

#[fixture]
fn workspace() -> Workspace {
    let dir = TempDir::new().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp path");
    Workspace { _dir: dir, path }
}

fn strings(args: Vec<std::ffi::OsString>) -> Vec<String> {
    args.into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[rstest]
fn ssh_args_place_command_last() {
    let transport = SshTransport::new(SshOptions::default());
    let mut target = endpoint("203.0.113.7");
    target.port = 2222;

    let args = strings(transport.ssh_args(&target, "echo hi"));

    assert_eq!(
        args,
        [
            "-p",
            "2222",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "root@203.0.113.7",
            "echo hi",
        ]
    );
}

#[rstest]
fn rsync_args_carry_excludes_and_remote_shell() {
    let transport = SshTransport::new(SshOptions::default());
    let mut target = endpoint("203.0.113.7");
    target.key_path = Some(String::from("/keys/id"));
    let request = SyncRequest {
        source: Utf8PathBuf::from("/work/proj"),
        destination: String::from("/root/proj"),
        excludes: vec![String::from(".git"), String::from("*.pyc")],
    };

    let args = strings(transport.rsync_args(&target, &request));

    assert_eq!(
        args,
        [
            "-pthrvz",
            "-L",
            "--exclude=.git",
            "--exclude=*.pyc",
            "-e",
            "ssh -p 22 -i /keys/id -o BatchMode=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
            "/work/proj/",
            "root@203.0.113.7:/root/proj",
        ]
    );
}

#[rstest]
fn interactive_command_omits_batch_mode() {
    let transport = SshTransport::new(SshOptions {
        known_hosts_file: String::new(),
        ..SshOptions::default()
    });
    let command = transport.interactive_command(&endpoint("h"));
    assert_eq!(command, "ssh -p 22 -o StrictHostKeyChecking=no root@h");
}

#[rstest]
fn excludes_layer_ignore_files(workspace: Workspace) {
    workspace.write(GIT_IGNORE_FILE, "target/\n# comment\n\n*.log\n");
    workspace.write(EXTRA_IGNORE_FILE, "data/\ntarget/\n");
    workspace.write(INCLUDE_FILE, "data/\n");

    let excludes = exclude_list(&workspace.path).expect("excludes should compute");

    assert_eq!(excludes, [".git", "target/", "*.log"]);
}

#[rstest]
fn hash_inside_a_pattern_is_kept(workspace: Workspace) {
    workspace.write(GIT_IGNORE_FILE, "  # indented comment\nbuild#1\nrun-#/\n");

    let excludes = exclude_list(&workspace.path).expect("excludes should compute");

    assert_eq!(excludes, [".git", "build#1", "run-#/"]);
}

#[rstest]
fn git_stays_excluded_despite_include(workspace: Workspace) {
    workspace.write(GIT_IGNORE_FILE, "target/\n");
    workspace.write(INCLUDE_FILE, ".git\ntarget/\n");

    let excludes = exclude_list(&workspace.path).expect("excludes should compute");

    assert_eq!(excludes, [".git"]);
}

#[rstest]
fn missing_ignore_files_exclude_only_git(workspace: Workspace) {
    let excludes = exclude_list(&workspace.path).expect("excludes should compute");
    assert_eq!(excludes, [".git"]);
}

#[rstest]
fn include_must_reference_an_exclusion(workspace: Workspace) {
    workspace.write(GIT_IGNORE_FILE, "target/\n");
    workspace.write(INCLUDE_FILE, "src/\n");

    let err = exclude_list(&workspace.path).expect_err("unknown include should fail");

    assert_eq!(
        err,
        RemoteError::UnknownInclude {
            file: INCLUDE_FILE.to_owned(),
            entry: String::from("src/"),
        }
    );
}

#[rstest]
#[case("setup.py", SetupDescriptor::EditablePackage)]
#[case("pyproject.toml", SetupDescriptor::EditablePackage)]
#[case("requirements.txt", SetupDescriptor::Requirements)]
fn detects_setup_descriptor(
    workspace: Workspace,
    #[case] file: &str,
    #[case] expected: SetupDescriptor,
) {
    workspace.write(file, "");
    assert_eq!(detect_setup(&workspace.path), Ok(expected));
}

#[rstest]
#[case(SetupDescriptor::EditablePackage, "/opt/py311/bin/python -m pip install -e .")]
#[case(
    SetupDescriptor::Requirements,
    "/opt/py311/bin/python -m pip install -r requirements.txt"
)]
fn install_runs_through_the_interpreter(
    #[case] descriptor: SetupDescriptor,
    #[case] expected: &str,
) {
    assert_eq!(descriptor.install_command("/opt/py311/bin/python"), expected);
}

#[rstest]
fn missing_setup_descriptor_is_an_error(workspace: Workspace) {
    let err = detect_setup(&workspace.path).expect_err("empty workspace has no descriptor");
    assert!(matches!(err, RemoteError::MissingSetupDescriptor { .. }));
}

#[rstest]
fn missing_source_directory_is_reported() {
    let err = exclude_list(Utf8PathBuf::from("/definitely/not/here").as_path())
        .expect_err("missing source should fail");
    assert!(matches!(err, RemoteError::MissingSource { .. }));
}

#[cfg(unix)]
fn fake_ssh(workspace: &Workspace, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = workspace.path.join("ssh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write ssh script");
    let mut permissions = fs::metadata(&path).expect("script metadata").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).expect("make script executable");
    path.into_string()
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn exec_keeps_reading_past_invalid_utf8(workspace: Workspace) {
    let transport = SshTransport::new(SshOptions {
        ssh_bin: fake_ssh(&workspace, r"printf 'before\n\377\376 bad\r\nafter\n'"),
        ..SshOptions::default()
    });
    let sink = SharedOutput::new();
    sink.begin("cat data.bin", 100);

    let code = transport
        .exec(&endpoint("h"), "cat data.bin", &sink)
        .await
        .expect("binary output is not a transport failure");

    assert_eq!(code, Some(0));
    let output = sink.snapshot().expect("output was started");
    assert_eq!(
        output.stdout().iter().collect::<Vec<_>>(),
        ["before", "\u{fffd}\u{fffd} bad", "after"]
    );
}
