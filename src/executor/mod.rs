//! Concurrent fan-out of commands and transfers across a fleet.
//!
//! Every dispatch first waits for pending pods, then runs one task per
//! node inside a [`JoinSet`]. Tasks report `(position, result)` so outcomes
//! line up with the dispatched nodes whatever order they finish in. A
//! failing node never cancels its siblings.

use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::fleet::{Fleet, FleetError};
use crate::instance::PodName;
use crate::node::{Node, NodeResult};
use crate::output::CommandOutput;
use crate::provider::ProviderGateway;
use crate::remote::{RemoteError, RemoteTransport, detect_setup, exclude_list};

/// Commands to dispatch across a fleet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Commands {
    /// The same command on every node.
    Broadcast(String),
    /// One command per node, matched by position.
    PerNode(Vec<String>),
}

impl Commands {
    /// Broadcasts `command` to every node.
    #[must_use]
    pub fn broadcast(command: impl Into<String>) -> Self {
        Self::Broadcast(command.into())
    }

    fn assign<E>(self, nodes: usize) -> Result<Vec<String>, FleetError<E>>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Broadcast(command) => Ok(vec![command; nodes]),
            Self::PerNode(commands) if commands.len() == nodes => Ok(commands),
            Self::PerNode(commands) => Err(FleetError::CommandCountMismatch {
                commands: commands.len(),
                nodes,
            }),
        }
    }
}

/// Wait policy of a monitored dispatch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Monitor {
    /// Interval between progress checks.
    pub tick: Duration,
    /// Finished tasks after which the remaining ones are cancelled. Checked
    /// on each tick.
    pub threshold: Option<usize>,
}

impl Monitor {
    /// Waits for every task, reporting progress each `tick`.
    #[must_use]
    pub const fn new(tick: Duration) -> Self {
        Self {
            tick,
            threshold: None,
        }
    }

    /// Stops waiting once `threshold` tasks have finished.
    #[must_use]
    pub const fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// What happened on one node during a dispatch.
#[derive(Clone, Debug)]
pub enum NodeOutcome {
    /// The command ran to completion; the exit code may still be non-zero.
    Completed(CommandOutput),
    /// The host key could not be verified and the pod was terminated.
    Removed,
    /// The command could not run.
    Failed(String),
    /// The task was cancelled before finishing.
    Cancelled,
}

/// Outcome of one node in a dispatch.
#[derive(Clone, Debug)]
pub struct NodeReport {
    /// Provider id.
    pub id: String,
    /// Display name.
    pub name: PodName,
    /// What happened.
    pub outcome: NodeOutcome,
}

/// Per-node outcomes of a dispatch, in dispatch order.
#[derive(Clone, Debug, Default)]
pub struct FanOutReport {
    /// One entry per dispatched node.
    pub entries: Vec<NodeReport>,
}

impl FanOutReport {
    /// Looks up the entry of `id`.
    #[must_use]
    pub fn entry(&self, id: &str) -> Option<&NodeReport> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Number of nodes whose command ran to completion.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.outcome, NodeOutcome::Completed(_)))
            .count()
    }

    /// Number of cancelled nodes.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.outcome, NodeOutcome::Cancelled))
            .count()
    }

    fn assemble<G, T>(nodes: &[Node<G, T>], slots: Vec<Option<NodeOutcome>>) -> Self {
        let entries = nodes
            .iter()
            .zip(slots)
            .map(|(node, slot)| NodeReport {
                id: node.id().to_owned(),
                name: node.name().clone(),
                outcome: slot.unwrap_or(NodeOutcome::Cancelled),
            })
            .collect();
        Self { entries }
    }
}

/// Outcome of a fleet-wide workspace transfer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncReport {
    /// Pods that received the workspace.
    pub synced: Vec<PodName>,
    /// Pods terminated because their host key could not be verified.
    pub removed: Vec<PodName>,
    /// Pods whose transfer failed, with the error.
    pub failed: Vec<(PodName, String)>,
}

/// Outcome of [`Fleet::setup`].
#[derive(Clone, Debug)]
pub struct SetupReport {
    /// Workspace transfer.
    pub sync: SyncReport,
    /// Dependency installation.
    pub install: FanOutReport,
}

/// Outcome of [`Fleet::prune`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PruneReport {
    /// Ids kept, fastest first.
    pub kept: Vec<String>,
    /// Ids terminated.
    pub removed: Vec<String>,
}

/// Live view of one node's latest command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeProgress {
    /// Display name.
    pub name: PodName,
    /// Whether the latest command is still running.
    pub running: bool,
    /// Retained stdout lines.
    pub stdout_lines: usize,
    /// Retained stderr lines.
    pub stderr_lines: usize,
    /// Exit code of a finished command.
    pub exit_code: Option<i32>,
    /// Time spent so far, or total time once finished.
    pub elapsed: Option<Duration>,
}

type Dispatched<E> = (usize, Result<Option<CommandOutput>, FleetError<E>>);

impl<G: ProviderGateway, T: RemoteTransport> Fleet<G, T> {
    /// Runs commands on every node and waits for all of them.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::CommandCountMismatch`] before dispatching when
    /// per-node commands do not match the fleet size, and errors of the
    /// preceding pending wait. Per-node failures are reported in the
    /// returned [`FanOutReport`] instead.
    pub async fn run(
        &mut self,
        commands: Commands,
        in_folder: bool,
        purge_after: bool,
    ) -> NodeResult<FanOutReport, G> {
        self.dispatch(commands, in_folder, purge_after, None).await
    }

    /// Runs commands on every node, cancelling the stragglers once the
    /// monitor's threshold is reached.
    ///
    /// # Errors
    ///
    /// See [`Fleet::run`].
    pub async fn run_with_monitor(
        &mut self,
        commands: Commands,
        in_folder: bool,
        monitor: Monitor,
    ) -> NodeResult<FanOutReport, G> {
        self.dispatch(commands, in_folder, false, Some(monitor)).await
    }

    /// Runs the configured interpreter with `args` in every workspace.
    ///
    /// # Errors
    ///
    /// See [`Fleet::run`].
    pub async fn run_py(&mut self, args: &str) -> NodeResult<FanOutReport, G> {
        let command = format!("{} {args}", self.context().project.interpreter);
        self.run(Commands::Broadcast(command), true, false).await
    }

    async fn dispatch(
        &mut self,
        commands: Commands,
        in_folder: bool,
        purge_after: bool,
        monitor: Option<Monitor>,
    ) -> NodeResult<FanOutReport, G> {
        self.wait_pending().await?;
        let assigned = commands.assign(self.len())?;
        let targets: Vec<(Node<G, T>, String)> = self
            .nodes()
            .iter()
            .zip(assigned)
            .filter(|(node, _)| self.is_dispatchable(node))
            .map(|(node, command)| (node.clone(), command))
            .collect();
        let watched: Vec<Node<G, T>> = targets.iter().map(|(node, _)| node.clone()).collect();
        info!(pods = watched.len(), "dispatching command");

        let mut tasks = JoinSet::new();
        for (position, (worker, command)) in targets.into_iter().enumerate() {
            tasks.spawn(async move {
                let result = worker.run(&command, in_folder, purge_after).await;
                if let Err(err) = &result {
                    warn!(
                        instance_id = %worker.id(),
                        name = %worker.name(),
                        error = %err,
                        "command failed on pod"
                    );
                }
                (position, result)
            });
        }

        let mut slots: Vec<Option<NodeOutcome>> =
            std::iter::repeat_with(|| None).take(watched.len()).collect();
        if let Some(policy) = monitor {
            supervise(&mut tasks, &mut slots, &watched, policy).await;
        } else {
            while let Some(joined) = tasks.join_next().await {
                record(&mut slots, joined);
            }
        }
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            record(&mut slots, joined);
        }

        self.drain_purged();
        Ok(FanOutReport::assemble(&watched, slots))
    }

    /// Transfers the workspace to every node concurrently.
    ///
    /// Pods whose host key cannot be verified are terminated; other
    /// transfer failures are reported per pod.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Remote`] when the ignore files are
    /// misconfigured, and termination or pending-wait errors.
    pub async fn sync(&mut self) -> NodeResult<SyncReport, G> {
        self.wait_pending().await?;
        let excludes = exclude_list(&self.context().project.source_dir)?;
        let transfers: Vec<_> = self
            .active_nodes()
            .into_iter()
            .map(|node| {
                let handle = node.sync_with_excludes(excludes.clone());
                (node, handle)
            })
            .collect();
        info!(pods = transfers.len(), "synchronising workspace");

        let mut report = SyncReport::default();
        for (node, handle) in transfers {
            match handle.join().await {
                Ok(()) => report.synced.push(node.name().clone()),
                Err(RemoteError::HostKeyUnverifiable { host }) => {
                    warn!(
                        instance_id = %node.id(),
                        host = %host,
                        "host key could not be verified; terminating pod"
                    );
                    node.remove().await?;
                    report.removed.push(node.name().clone());
                }
                Err(err) => {
                    warn!(instance_id = %node.id(), name = %node.name(), error = %err, "sync failed");
                    report.failed.push((node.name().clone(), err.to_string()));
                }
            }
        }
        self.drain_purged();
        Ok(report)
    }

    /// Synchronises the workspace, then installs its dependencies on every
    /// node under the monitor, tolerating a slow minority when `threshold`
    /// is set.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Remote`] when the workspace has no setup
    /// descriptor, plus any error of [`Fleet::sync`].
    pub async fn setup(&mut self, threshold: Option<usize>) -> NodeResult<SetupReport, G> {
        let sync = self.sync().await?;
        let project = &self.context().project;
        let command = detect_setup(&project.source_dir)?.install_command(&project.interpreter);
        let mut monitor = Monitor::new(self.context().settings.monitor_tick);
        monitor.threshold = threshold;
        let install = self
            .run_with_monitor(Commands::broadcast(command), true, monitor)
            .await?;
        Ok(SetupReport { sync, install })
    }

    /// Races `probe` across the fleet and keeps the `keep` fastest nodes.
    ///
    /// Nodes that do not finish before the monitor stops are terminated,
    /// as are finishers slower than the `keep` fastest.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::TerminationFailed`] when a node cannot be
    /// terminated, plus any error of [`Fleet::run_with_monitor`].
    pub async fn prune(&mut self, keep: usize, probe: &str) -> NodeResult<PruneReport, G> {
        let monitor = Monitor::new(self.context().settings.monitor_tick).with_threshold(keep);
        let report = self
            .run_with_monitor(Commands::broadcast(probe), true, monitor)
            .await?;

        let mut finishers = Vec::new();
        let mut laggards = Vec::new();
        for entry in report.entries {
            match entry.outcome {
                NodeOutcome::Completed(output) => {
                    let Some(elapsed) = output.elapsed() else {
                        laggards.push(entry.id);
                        continue;
                    };
                    finishers.push((entry.id, elapsed));
                }
                NodeOutcome::Removed => {}
                NodeOutcome::Failed(_) | NodeOutcome::Cancelled => laggards.push(entry.id),
            }
        }
        let mut kept = rank_by_elapsed(finishers);
        let slower = kept.split_off(keep.min(kept.len()));

        let mut removed = Vec::new();
        for id in laggards.into_iter().chain(slower) {
            if let Some(node) = self.get(&id).cloned() {
                node.remove().await?;
                removed.push(id);
            }
        }
        self.drain_purged();
        info!(kept = kept.len(), removed = removed.len(), "prune complete");
        Ok(PruneReport { kept, removed })
    }

    /// Progress of every tracked node's latest command.
    #[must_use]
    pub fn progress(&self) -> Vec<NodeProgress> {
        progress_of(self.nodes())
    }
}

async fn supervise<G, T, E>(
    tasks: &mut JoinSet<Dispatched<E>>,
    slots: &mut [Option<NodeOutcome>],
    watched: &[Node<G, T>],
    monitor: Monitor,
) where
    E: std::error::Error + Send + 'static,
{
    let mut ticker = interval_at(Instant::now() + monitor.tick, monitor.tick);
    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                let Some(result) = joined else {
                    break;
                };
                record(slots, result);
            }
            _ = ticker.tick() => {
                let done = slots.iter().filter(|slot| slot.is_some()).count();
                info!(done, total = slots.len(), "waiting for pods");
                for entry in progress_of(watched) {
                    debug!(
                        name = %entry.name,
                        running = entry.running,
                        stdout_lines = entry.stdout_lines,
                        stderr_lines = entry.stderr_lines,
                        "pod progress"
                    );
                }
                if monitor.threshold.is_some_and(|threshold| done >= threshold) {
                    info!(done, "completion threshold reached; cancelling the rest");
                    break;
                }
            }
        }
    }
}

fn record<E>(slots: &mut [Option<NodeOutcome>], joined: Result<Dispatched<E>, JoinError>)
where
    E: std::error::Error + 'static,
{
    match joined {
        Ok((position, result)) => {
            let outcome = match result {
                Ok(Some(output)) => NodeOutcome::Completed(output),
                Ok(None) => NodeOutcome::Removed,
                Err(err) => NodeOutcome::Failed(err.to_string()),
            };
            if let Some(slot) = slots.get_mut(position) {
                *slot = Some(outcome);
            }
        }
        Err(err) if err.is_cancelled() => {}
        Err(err) => warn!(error = %err, "fan-out task panicked"),
    }
}

fn progress_of<G, T>(nodes: &[Node<G, T>]) -> Vec<NodeProgress> {
    nodes
        .iter()
        .map(|node| {
            let latest = node.output();
            NodeProgress {
                name: node.name().clone(),
                running: latest.as_ref().is_some_and(CommandOutput::is_running),
                stdout_lines: latest.as_ref().map_or(0, |output| output.stdout().len()),
                stderr_lines: latest.as_ref().map_or(0, |output| output.stderr().len()),
                exit_code: latest.as_ref().and_then(CommandOutput::exit_code),
                elapsed: latest
                    .as_ref()
                    .map(|output| output.elapsed().unwrap_or_else(|| output.age())),
            }
        })
        .collect()
}

/// Orders finishers by elapsed time, fastest first. Ties keep their order.
pub(crate) fn rank_by_elapsed(mut finishers: Vec<(String, Duration)>) -> Vec<String> {
    finishers.sort_by_key(|(_, elapsed)| *elapsed);
    finishers.into_iter().map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests;
