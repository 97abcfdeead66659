//! Unit tests for fan-out, monitoring, sync and pruning.

use std::fs;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::provider::ResourceOverrides;
use crate::test_support::{
    FakeProvider, HostScript, ScriptedTransport, TransportCall, context, record,
};

type TestFleet = Fleet<FakeProvider, ScriptedTransport>;

struct Rig {
    provider: FakeProvider,
    transport: ScriptedTransport,
    workspace: TempDir,
}

impl Rig {
    fn with_pods(count: u32) -> Self {
        let provider = FakeProvider::new();
        for index in 0..count {
            let id = char::from_u32(u32::from('a').saturating_add(index)).unwrap_or('z');
            provider.add(record(&id.to_string(), &format!("grp_{index}")));
        }
        Self {
            provider,
            transport: ScriptedTransport::new(),
            workspace: TempDir::new().expect("create temp dir"),
        }
    }

    fn write(&self, name: &str) {
        fs::write(self.workspace.path().join(name), "").expect("write workspace file");
    }

    async fn fleet(&self) -> TestFleet {
        let source = Utf8PathBuf::from_path_buf(self.workspace.path().to_path_buf())
            .expect("utf-8 temp path");
        Fleet::discover(
            context(self.provider.clone(), self.transport.clone(), source),
            Some(String::from("grp")),
            ResourceOverrides::default(),
        )
        .await
        .expect("discovery should succeed")
    }
}

#[fixture]
fn trio() -> Rig {
    Rig::with_pods(3)
}

fn outcome<'a>(report: &'a FanOutReport, id: &str) -> &'a NodeOutcome {
    &report.entry(id).expect("node was dispatched").outcome
}

fn ids(fleet: &TestFleet) -> Vec<&str> {
    fleet.nodes().iter().map(Node::id).collect()
}

fn sorted(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values
}

#[rstest]
#[tokio::test]
async fn broadcast_reaches_every_node(trio: Rig) {
    trio.transport
        .script("host-b", HostScript::new().stdout(&["hello from b"]));
    let mut fleet = trio.fleet().await;

    let report = fleet
        .run(Commands::broadcast("hostname"), false, false)
        .await
        .expect("dispatch should succeed");

    assert_eq!(report.completed(), 3);
    let NodeOutcome::Completed(output) = outcome(&report, "b") else {
        panic!("b should complete");
    };
    assert_eq!(output.stdout().last(), Some("hello from b"));
    assert_eq!(
        sorted(trio.transport.exec_hosts()),
        ["host-a", "host-b", "host-c"]
    );
}

#[rstest]
#[tokio::test]
async fn per_node_commands_follow_positions(trio: Rig) {
    let mut fleet = trio.fleet().await;
    let commands = Commands::PerNode(vec![
        String::from("echo 0"),
        String::from("echo 1"),
        String::from("echo 2"),
    ]);

    fleet
        .run(commands, false, false)
        .await
        .expect("dispatch should succeed");

    for call in trio.transport.calls() {
        let TransportCall::Exec { host, command } = call else {
            panic!("only commands were dispatched");
        };
        let expected = match host.as_str() {
            "host-a" => "echo 0",
            "host-b" => "echo 1",
            _ => "echo 2",
        };
        assert!(command.ends_with(expected), "{host} ran {command}");
    }
}

#[rstest]
#[tokio::test]
async fn command_count_must_match_nodes(trio: Rig) {
    let mut fleet = trio.fleet().await;

    let err = fleet
        .run(Commands::PerNode(vec![String::from("true")]), false, false)
        .await
        .expect_err("mismatch must fail fast");

    assert!(matches!(
        err,
        FleetError::CommandCountMismatch {
            commands: 1,
            nodes: 3
        }
    ));
    assert!(trio.transport.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn untrusted_host_is_removed_without_failing_siblings(trio: Rig) {
    trio.transport
        .script("host-b", HostScript::new().untrusted());
    let mut fleet = trio.fleet().await;

    let report = fleet
        .run(Commands::broadcast("nvidia-smi"), false, false)
        .await
        .expect("trust failures stay inside the fan-out");

    assert!(matches!(outcome(&report, "a"), NodeOutcome::Completed(_)));
    assert!(matches!(outcome(&report, "b"), NodeOutcome::Removed));
    assert!(matches!(outcome(&report, "c"), NodeOutcome::Completed(_)));
    assert_eq!(ids(&fleet), ["a", "c"]);
    assert_eq!(trio.provider.terminated(), ["b"]);
}

#[rstest]
#[tokio::test]
async fn failing_node_is_reported_per_node(trio: Rig) {
    let mut fleet = trio.fleet().await;
    let commands = Commands::PerNode(vec![
        String::from("echo ok"),
        String::from("echo 'quoted'"),
        String::from("echo ok"),
    ]);

    let report = fleet
        .run(commands, false, false)
        .await
        .expect("per-node errors do not abort the dispatch");

    assert_eq!(report.completed(), 2);
    assert!(matches!(outcome(&report, "b"), NodeOutcome::Failed(message) if message.contains("single quotes")));
    assert_eq!(ids(&fleet), ["a", "b", "c"]);
}

#[rstest]
#[tokio::test]
async fn vanished_nodes_are_skipped(trio: Rig) {
    let mut fleet = trio.fleet().await;
    trio.provider.hide("c");

    let report = fleet
        .run(Commands::broadcast("true"), false, false)
        .await
        .expect("dispatch should succeed");

    assert_eq!(report.entries.len(), 2);
    assert!(report.entry("c").is_none());
    assert!(!trio.transport.exec_hosts().contains(&String::from("host-c")));
}

#[rstest]
#[tokio::test]
async fn purge_after_terminates_every_node(trio: Rig) {
    let mut fleet = trio.fleet().await;

    fleet
        .run(Commands::broadcast("true"), false, true)
        .await
        .expect("dispatch should succeed");

    assert!(fleet.is_empty());
    assert_eq!(sorted(trio.provider.terminated()), ["a", "b", "c"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn monitor_cancels_stragglers_once_threshold_is_met(trio: Rig) {
    trio.transport
        .script("host-a", HostScript::new().delay(Duration::from_secs(1)));
    trio.transport
        .script("host-b", HostScript::new().delay(Duration::from_secs(2)));
    trio.transport
        .script("host-c", HostScript::new().delay(Duration::from_secs(600)));
    let mut fleet = trio.fleet().await;
    let monitor = Monitor::new(Duration::from_secs(5)).with_threshold(2);

    let report = fleet
        .run_with_monitor(Commands::broadcast("train"), false, monitor)
        .await
        .expect("dispatch should succeed");

    assert_eq!(report.completed(), 2);
    assert!(matches!(outcome(&report, "c"), NodeOutcome::Cancelled));
    let straggler = fleet.get("c").expect("cancelled nodes stay tracked");
    assert!(straggler.output().is_some_and(|output| output.is_running()));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn monitor_without_threshold_waits_for_everyone(trio: Rig) {
    trio.transport
        .script("host-c", HostScript::new().delay(Duration::from_secs(12)));
    let mut fleet = trio.fleet().await;

    let report = fleet
        .run_with_monitor(
            Commands::broadcast("train"),
            false,
            Monitor::new(Duration::from_secs(5)),
        )
        .await
        .expect("dispatch should succeed");

    assert_eq!(report.completed(), 3);
    assert_eq!(report.cancelled(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn prune_keeps_the_fastest_nodes() {
    let rig = Rig::with_pods(5);
    for (host, secs) in [
        ("host-a", 1),
        ("host-b", 2),
        ("host-c", 3),
        ("host-d", 4),
        ("host-e", 5),
    ] {
        rig.transport
            .script(host, HostScript::new().delay(Duration::from_secs(secs)));
    }
    let mut fleet = rig.fleet().await;

    let report = fleet.prune(2, "python probe.py").await.expect("prune");

    assert_eq!(report.kept, ["a", "b"]);
    assert_eq!(sorted(report.removed), ["c", "d", "e"]);
    assert_eq!(sorted(rig.provider.terminated()), ["c", "d", "e"]);
    assert_eq!(ids(&fleet), ["a", "b"]);
}

#[rstest]
fn ranking_is_stable_for_ties() {
    let ranked = rank_by_elapsed(vec![
        (String::from("slow"), Duration::from_secs(9)),
        (String::from("first"), Duration::from_secs(1)),
        (String::from("second"), Duration::from_secs(1)),
    ]);

    assert_eq!(ranked, ["first", "second", "slow"]);
}

#[rstest]
#[tokio::test]
async fn run_py_uses_interpreter_in_workspace(trio: Rig) {
    let mut fleet = trio.fleet().await;

    fleet
        .run_py("train.py --epochs 3")
        .await
        .expect("dispatch should succeed");

    let Some(TransportCall::Exec { command, .. }) = trio.transport.calls().into_iter().next()
    else {
        panic!("expected a command");
    };
    assert!(command.ends_with("cd work; /bin/python3 train.py --epochs 3"));
}

#[rstest]
#[tokio::test]
async fn sync_isolates_failures(trio: Rig) {
    trio.transport
        .script("host-b", HostScript::new().failing_sync("connection reset"));
    trio.transport
        .script("host-c", HostScript::new().untrusted());
    let mut fleet = trio.fleet().await;

    let report = fleet.sync().await.expect("sync should complete");

    assert_eq!(report.synced, [PodName::grouped("grp", 0)]);
    assert_eq!(report.removed, [PodName::grouped("grp", 2)]);
    let (failed, message) = report.failed.first().expect("one failure");
    assert_eq!(failed, &PodName::grouped("grp", 1));
    assert!(message.contains("connection reset"));
    assert_eq!(ids(&fleet), ["a", "b"]);
}

#[rstest]
#[tokio::test]
async fn setup_syncs_then_installs(trio: Rig) {
    trio.write("requirements.txt");
    let mut fleet = trio.fleet().await;

    let report = fleet.setup(None).await.expect("setup should succeed");

    assert_eq!(report.sync.synced.len(), 3);
    assert_eq!(report.install.completed(), 3);
    let installs = trio
        .transport
        .calls()
        .into_iter()
        .filter(|call| {
            matches!(call, TransportCall::Exec { command, .. }
                if command.ends_with("; /bin/python3 -m pip install -r requirements.txt"))
        })
        .count();
    assert_eq!(installs, 3);
}

#[rstest]
#[tokio::test]
async fn setup_requires_a_descriptor(trio: Rig) {
    let mut fleet = trio.fleet().await;

    let err = fleet.setup(None).await.expect_err("nothing to install");

    assert!(matches!(
        err,
        FleetError::Remote(RemoteError::MissingSetupDescriptor { .. })
    ));
}

#[rstest]
#[tokio::test]
async fn progress_reflects_latest_output(trio: Rig) {
    trio.transport.script(
        "host-a",
        HostScript::new().stdout(&["1", "2"]).exit_code(4),
    );
    let mut fleet = trio.fleet().await;

    fleet
        .run(Commands::broadcast("work"), false, false)
        .await
        .expect("dispatch should succeed");
    let progress = fleet.progress();

    let first = progress.first().expect("three nodes");
    assert_eq!(first.name, PodName::grouped("grp", 0));
    assert!(!first.running);
    assert_eq!(first.stdout_lines, 2);
    assert_eq!(first.exit_code, Some(4));
    assert!(progress.iter().all(|entry| entry.elapsed.is_some()));
}
