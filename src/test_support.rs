//! Test support utilities shared across unit and integration tests.
//!
//! Provides scripted doubles for the three seams of the crate: process
//! execution ([`ScriptedRunner`]), the provider ([`FakeProvider`]) and the
//! remote transport ([`ScriptedTransport`]).

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::time::sleep;

use crate::config::{AwsConfig, RunPodConfig};
use crate::fleet::{FleetContext, FleetSettings, Project};
use crate::instance::{InstanceRecord, PodName, Resources, SshEndpoint};
use crate::output::SharedOutput;
use crate::provider::{
    CommandRunner, CreateRequest, DegradedInstance, ProcessOutput, ProviderError, ProviderFuture,
    ProviderGateway, RunnerFuture, Snapshot,
};
use crate::remote::{RemoteError, RemoteFuture, RemoteTransport, SyncRequest};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic provider CLI outcomes without spawning
/// processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<ProcessOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len().saturating_add(1));
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(ProcessOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        let response = lock(&self.responses).pop_front();
        Box::pin(async move {
            response.ok_or_else(|| ProviderError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
        })
    }
}

/// Builds an endpoint with RunPod conventions for `host`.
#[must_use]
pub fn endpoint(host: &str) -> SshEndpoint {
    SshEndpoint {
        host: host.to_owned(),
        port: 22,
        user: String::from("root"),
        key_path: None,
        home_dir: String::from("/root"),
        env_file: String::from("/etc/rp_environment"),
    }
}

/// Builds a running record reachable at `host-{id}`.
#[must_use]
pub fn record(id: &str, name: &str) -> InstanceRecord {
    InstanceRecord {
        id: id.to_owned(),
        name: PodName::parse(name),
        status: String::from("RUNNING"),
        endpoint: endpoint(&format!("host-{id}")),
        resources: Resources::default(),
    }
}

/// RunPod configuration without an API key.
#[must_use]
pub fn runpod_config() -> RunPodConfig {
    RunPodConfig {
        runpodctl_bin: String::from("runpodctl"),
        api_key: None,
        image: String::from("runpod/pytorch:latest"),
        template_id: None,
        network_volume_id: None,
        volume_mount_path: String::from("/root/workspace"),
        gpu_type: String::from("NVIDIA GeForce RTX 4090"),
        gpu_count: 1,
        vcpu: 16,
        memory_gb: 60,
        volume_gb: 100,
        container_disk_gb: 20,
        secure_cloud: true,
        forward_env: String::from("WANDB_API_KEY"),
        ssh_key_path: None,
    }
}

/// EC2 configuration ready for launches.
#[must_use]
pub fn aws_config() -> AwsConfig {
    AwsConfig {
        aws_bin: String::from("aws"),
        region: None,
        ami_id: String::from("ami-base"),
        instance_type: String::from("g5.xlarge"),
        key_name: String::from("fleet"),
        security_group_ids: String::from("sg-1,sg-2"),
        subnet_id: None,
        volume_gb: 100,
        iam_instance_profile: None,
        ssh_user: String::from("ubuntu"),
        ssh_key_path: None,
        owner_tag: String::from("PodFleet"),
    }
}

/// Workspace rooted at `source_dir`, synchronised to `~/work`.
#[must_use]
pub fn project(source_dir: impl Into<Utf8PathBuf>) -> Project {
    Project {
        source_dir: source_dir.into(),
        remote_dir: String::from("work"),
        interpreter: String::from("/bin/python3"),
        use_venv: false,
    }
}

/// Limits small enough to keep retry loops short under a paused clock.
#[must_use]
pub fn test_settings() -> FleetSettings {
    FleetSettings {
        pending_timeout: Duration::from_secs(60),
        list_max_attempts: 3,
        purge_failing_after: 3,
        ..FleetSettings::default()
    }
}

/// Bundles the doubles into a shared fleet context.
#[must_use]
pub fn context(
    provider: FakeProvider,
    transport: ScriptedTransport,
    source_dir: impl Into<Utf8PathBuf>,
) -> Arc<FleetContext<FakeProvider, ScriptedTransport>> {
    Arc::new(FleetContext::new(
        provider,
        transport,
        project(source_dir),
        test_settings(),
    ))
}

#[derive(Debug)]
struct FakeInstance {
    record: InstanceRecord,
    hidden_for: u32,
    degraded: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    instances: Vec<FakeInstance>,
    creation_delay: u32,
    next_id: u32,
    list_failures: u32,
    terminate_failures: HashMap<String, u32>,
    sticky: HashSet<String>,
    terminated: Vec<String>,
    calls: Vec<String>,
}

/// In-memory provider.
///
/// Created instances stay invisible for a configurable number of listings,
/// terminations can be scripted to fail, and every call is logged as
/// `list`, `create <name>` or `terminate <id>`.
#[derive(Clone, Debug, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listed, reachable instance.
    pub fn add(&self, record: InstanceRecord) {
        lock(&self.state).instances.push(FakeInstance {
            record,
            hidden_for: 0,
            degraded: false,
        });
    }

    /// Adds an instance listed without a usable endpoint.
    pub fn add_degraded(&self, id: &str, name: &str) {
        lock(&self.state).instances.push(FakeInstance {
            record: record(id, name),
            hidden_for: 0,
            degraded: true,
        });
    }

    /// Drops `id` from listings without terminating it.
    pub fn hide(&self, id: &str) {
        lock(&self.state)
            .instances
            .retain(|instance| instance.record.id != id);
    }

    /// Number of listings a created instance stays invisible for.
    pub fn set_creation_delay(&self, listings: u32) {
        lock(&self.state).creation_delay = listings;
    }

    /// Fails the next `times` listings.
    pub fn fail_listings(&self, times: u32) {
        lock(&self.state).list_failures = times;
    }

    /// Fails the next `times` terminations of `id`.
    pub fn fail_terminations(&self, id: &str, times: u32) {
        lock(&self.state)
            .terminate_failures
            .insert(id.to_owned(), times);
    }

    /// Acknowledges terminations of `id` but keeps listing it.
    pub fn keep_listing(&self, id: &str) {
        lock(&self.state).sticky.insert(id.to_owned());
    }

    /// Ids terminated so far, in call order.
    #[must_use]
    pub fn terminated(&self) -> Vec<String> {
        lock(&self.state).terminated.clone()
    }

    /// Ids currently known to the provider, visible or not.
    #[must_use]
    pub fn live_ids(&self) -> Vec<String> {
        lock(&self.state)
            .instances
            .iter()
            .map(|instance| instance.record.id.clone())
            .collect()
    }

    /// Call log.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn listing(&self) -> Result<Snapshot, ProviderError> {
        let mut state = lock(&self.state);
        state.calls.push(String::from("list"));
        if state.list_failures > 0 {
            state.list_failures = state.list_failures.saturating_sub(1);
            return Err(ProviderError::failure(
                "fake",
                "list",
                Some(1),
                "scripted listing failure",
            ));
        }
        let mut snapshot = Snapshot::default();
        for instance in &mut state.instances {
            if instance.hidden_for > 0 {
                instance.hidden_for = instance.hidden_for.saturating_sub(1);
                continue;
            }
            if instance.degraded {
                snapshot.degraded.push(DegradedInstance {
                    id: instance.record.id.clone(),
                    name: instance.record.name.to_string(),
                    reason: String::from("no public tcp endpoint for port 22"),
                });
            } else {
                snapshot.instances.push(instance.record.clone());
            }
        }
        Ok(snapshot)
    }

    fn create(&self, request: &CreateRequest) -> String {
        let mut state = lock(&self.state);
        state.calls.push(format!("create {}", request.name));
        let id = format!("fake-{}", state.next_id);
        state.next_id = state.next_id.saturating_add(1);
        let hidden_for = state.creation_delay;
        state.instances.push(FakeInstance {
            record: record(&id, &request.name),
            hidden_for,
            degraded: false,
        });
        id
    }

    fn terminate(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("terminate {id}"));
        if let Some(remaining) = state.terminate_failures.get_mut(id)
            && *remaining > 0
        {
            *remaining = remaining.saturating_sub(1);
            return Err(ProviderError::failure(
                "fake",
                "terminate",
                Some(1),
                "scripted termination failure",
            ));
        }
        state.terminated.push(id.to_owned());
        if !state.sticky.contains(id) {
            state.instances.retain(|instance| instance.record.id != id);
        }
        Ok(())
    }
}

impl ProviderGateway for FakeProvider {
    type Error = ProviderError;

    fn list_instances<'a>(
        &'a self,
        _region: Option<&'a str>,
    ) -> ProviderFuture<'a, Snapshot, Self::Error> {
        let result = self.listing();
        Box::pin(async move { result })
    }

    fn create_instance<'a>(
        &'a self,
        request: &'a CreateRequest,
    ) -> ProviderFuture<'a, String, Self::Error> {
        let id = self.create(request);
        Box::pin(async move { Ok(id) })
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        let result = self.terminate(id);
        Box::pin(async move { result })
    }
}

/// Scripted behaviour of one host behind [`ScriptedTransport`].
#[derive(Clone, Debug, Default)]
pub struct HostScript {
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit_code: Option<i32>,
    delay: Duration,
    untrusted: bool,
    sync_failure: Option<String>,
}

impl HostScript {
    /// Successful command with no output.
    #[must_use]
    pub fn new() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    /// Lines emitted on stdout.
    #[must_use]
    pub fn stdout(mut self, lines: &[&str]) -> Self {
        self.stdout = lines.iter().map(|line| (*line).to_owned()).collect();
        self
    }

    /// Lines emitted on stderr.
    #[must_use]
    pub fn stderr(mut self, lines: &[&str]) -> Self {
        self.stderr = lines.iter().map(|line| (*line).to_owned()).collect();
        self
    }

    /// Exit code reported when the command ends.
    #[must_use]
    pub const fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Time between the output and the exit, and the duration of syncs.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails host key verification on every call.
    #[must_use]
    pub const fn untrusted(mut self) -> Self {
        self.untrusted = true;
        self
    }

    /// Fails workspace transfers with `stderr`.
    #[must_use]
    pub fn failing_sync(mut self, stderr: &str) -> Self {
        self.sync_failure = Some(stderr.to_owned());
        self
    }
}

/// Call observed by [`ScriptedTransport`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportCall {
    /// Remote command.
    Exec {
        /// Target host.
        host: String,
        /// Full remote shell line.
        command: String,
    },
    /// Workspace transfer.
    Sync {
        /// Target host.
        host: String,
        /// Remote destination directory.
        destination: String,
        /// Exclude patterns.
        excludes: Vec<String>,
    },
}

/// Transport that replays per-host scripts instead of running ssh.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    scripts: Arc<Mutex<HashMap<String, HostScript>>>,
    calls: Arc<Mutex<Vec<TransportCall>>>,
}

impl ScriptedTransport {
    /// Creates a transport where every host succeeds silently.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts `host`.
    pub fn script(&self, host: &str, script: HostScript) {
        lock(&self.scripts).insert(host.to_owned(), script);
    }

    /// Call log.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    /// Hosts that received a command, in call order.
    #[must_use]
    pub fn exec_hosts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Exec { host, .. } => Some(host),
                TransportCall::Sync { .. } => None,
            })
            .collect()
    }

    fn script_for(&self, host: &str) -> HostScript {
        lock(&self.scripts)
            .get(host)
            .cloned()
            .unwrap_or_else(HostScript::new)
    }
}

impl RemoteTransport for ScriptedTransport {
    fn exec<'a>(
        &'a self,
        endpoint: &'a SshEndpoint,
        command: &'a str,
        sink: &'a SharedOutput,
    ) -> RemoteFuture<'a, Option<i32>> {
        lock(&self.calls).push(TransportCall::Exec {
            host: endpoint.host.clone(),
            command: command.to_owned(),
        });
        let script = self.script_for(&endpoint.host);
        Box::pin(async move {
            if script.untrusted {
                return Err(RemoteError::HostKeyUnverifiable {
                    host: endpoint.host.clone(),
                });
            }
            for line in script.stdout {
                sink.push_stdout(line);
            }
            for line in script.stderr {
                sink.push_stderr(line);
            }
            sleep(script.delay).await;
            Ok(script.exit_code)
        })
    }

    fn sync<'a>(
        &'a self,
        endpoint: &'a SshEndpoint,
        request: &'a SyncRequest,
    ) -> RemoteFuture<'a, ()> {
        lock(&self.calls).push(TransportCall::Sync {
            host: endpoint.host.clone(),
            destination: request.destination.clone(),
            excludes: request.excludes.clone(),
        });
        let script = self.script_for(&endpoint.host);
        Box::pin(async move {
            sleep(script.delay).await;
            if script.untrusted {
                return Err(RemoteError::HostKeyUnverifiable {
                    host: endpoint.host.clone(),
                });
            }
            script.sync_failure.map_or(Ok(()), |stderr| {
                Err(RemoteError::SyncFailure {
                    program: String::from("rsync"),
                    status_text: String::from("23"),
                    stderr,
                })
            })
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: tokio::sync::MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
