//! End-to-end fleet scenarios against the in-memory provider and transport.

use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use podfleet::test_support::{FakeProvider, HostScript, ScriptedTransport, TransportCall, context, record};
use podfleet::{Commands, Fleet, NodeOutcome, ResourceOverrides};
use rstest::rstest;
use tempfile::TempDir;

type TestFleet = Fleet<FakeProvider, ScriptedTransport>;

fn workspace() -> (TempDir, Utf8PathBuf) {
    let dir = TempDir::new().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp path");
    (dir, path)
}

async fn discover(
    provider: &FakeProvider,
    transport: &ScriptedTransport,
    source: Utf8PathBuf,
    group: &str,
) -> TestFleet {
    Fleet::discover(
        context(provider.clone(), transport.clone(), source),
        Some(group.to_owned()),
        ResourceOverrides::default(),
    )
    .await
    .expect("discovery should succeed")
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn make_run_prune_and_purge() {
    let (_dir, source) = workspace();
    let provider = FakeProvider::new();
    let transport = ScriptedTransport::new();
    provider.set_creation_delay(2);
    for (host, secs) in [("host-fake-0", 3), ("host-fake-1", 1), ("host-fake-2", 2)] {
        transport.script(host, HostScript::new().delay(Duration::from_secs(secs)));
    }
    let mut fleet = discover(&provider, &transport, source, "exp").await;
    assert!(fleet.is_empty());

    let created = fleet.make_new_pods(3).await.expect("creation");
    assert_eq!(created, ["fake-0", "fake-1", "fake-2"]);

    let report = fleet
        .run(Commands::broadcast("hostname"), true, false)
        .await
        .expect("run waits for the new pods");
    assert_eq!(report.completed(), 3);
    let names: Vec<String> = fleet.nodes().iter().map(|node| node.name().to_string()).collect();
    assert_eq!(names, ["exp_0", "exp_1", "exp_2"]);

    let pruned = fleet.prune(2, "nvidia-smi").await.expect("prune");
    assert_eq!(pruned.kept, ["fake-1", "fake-2"]);
    assert_eq!(pruned.removed, ["fake-0"]);
    assert_eq!(fleet.len(), 2);

    fleet.purge().await.expect("purge should clear the group");
    assert!(fleet.is_empty());
    assert!(provider.live_ids().is_empty());
}

#[rstest]
#[tokio::test]
async fn setup_installs_editable_package_everywhere() {
    let (dir, source) = workspace();
    fs::write(dir.path().join("pyproject.toml"), "[project]\n").expect("write descriptor");
    fs::write(dir.path().join(".gitignore"), "*.ckpt\n").expect("write ignore file");
    let provider = FakeProvider::new();
    let transport = ScriptedTransport::new();
    provider.add(record("a", "exp_0"));
    provider.add(record("b", "exp_1"));
    let mut fleet = discover(&provider, &transport, source, "exp").await;

    let report = fleet.setup(None).await.expect("setup should succeed");

    assert_eq!(report.sync.synced.len(), 2);
    assert_eq!(report.install.completed(), 2);
    let calls = transport.calls();
    let syncs = calls
        .iter()
        .filter(|call| {
            matches!(call, TransportCall::Sync { excludes, .. }
                if excludes.iter().any(|pattern| pattern == "*.ckpt"))
        })
        .count();
    let installs = calls
        .iter()
        .filter(|call| {
            matches!(call, TransportCall::Exec { command, .. }
                if command.ends_with("/bin/python3 -m pip install -e ."))
        })
        .count();
    assert_eq!((syncs, installs), (2, 2));
}

#[rstest]
#[tokio::test]
async fn untrusted_pod_leaves_the_fleet_and_the_account() {
    let (_dir, source) = workspace();
    let provider = FakeProvider::new();
    let transport = ScriptedTransport::new();
    provider.add(record("a", "exp_0"));
    provider.add(record("b", "exp_1"));
    transport.script("host-b", HostScript::new().untrusted());
    let mut fleet = discover(&provider, &transport, source, "exp").await;

    let report = fleet
        .run(Commands::broadcast("true"), false, false)
        .await
        .expect("dispatch should succeed");

    assert!(matches!(
        report.entry("b").map(|entry| &entry.outcome),
        Some(NodeOutcome::Removed)
    ));
    assert_eq!(provider.live_ids(), ["a"]);

    fleet.reconcile().await.expect("listing should succeed");
    let ids: Vec<&str> = fleet.nodes().iter().map(|node| node.id()).collect();
    assert_eq!(ids, ["a"]);
}

#[rstest]
#[tokio::test]
async fn other_groups_are_untouched() {
    let (_dir, source) = workspace();
    let provider = FakeProvider::new();
    let transport = ScriptedTransport::new();
    provider.add(record("a", "exp_0"));
    provider.add(record("z", "other_0"));
    let mut fleet = discover(&provider, &transport, source, "exp").await;

    fleet.purge().await.expect("purge should succeed");

    assert_eq!(provider.terminated(), ["a"]);
    assert_eq!(provider.live_ids(), ["z"]);
}
