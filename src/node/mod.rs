//! A single pod: command execution, sync and termination.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::fleet::{FleetContext, FleetError};
use crate::instance::{InstanceRecord, PodName};
use crate::output::{CommandOutput, OutputStream, SharedOutput};
use crate::provider::ProviderGateway;
use crate::remote::{RemoteError, RemoteTransport, SyncRequest, detect_setup, exclude_list};

/// Result of node operations, carrying the provider's error type.
pub type NodeResult<T, G> = Result<T, FleetError<<G as ProviderGateway>::Error>>;

/// One tracked pod.
///
/// A node owns the latest [`InstanceRecord`] and the output of the latest
/// command. Clones share the output handle and the fleet context.
pub struct Node<G, T> {
    record: InstanceRecord,
    context: Arc<FleetContext<G, T>>,
    output: SharedOutput,
}

impl<G, T> Clone for Node<G, T> {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            context: Arc::clone(&self.context),
            output: self.output.clone(),
        }
    }
}

impl<G, T> fmt::Debug for Node<G, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl<G, T> Node<G, T> {
    /// Wraps a freshly listed record.
    #[must_use]
    pub fn new(record: InstanceRecord, context: Arc<FleetContext<G, T>>) -> Self {
        Self {
            record,
            context,
            output: SharedOutput::new(),
        }
    }

    /// Latest record.
    #[must_use]
    pub const fn record(&self) -> &InstanceRecord {
        &self.record
    }

    /// Provider id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Display name.
    #[must_use]
    pub const fn name(&self) -> &PodName {
        &self.record.name
    }

    /// Snapshot of the latest command output.
    #[must_use]
    pub fn output(&self) -> Option<CommandOutput> {
        self.output.snapshot()
    }

    /// Renders the selected stream(s) of the latest command output.
    #[must_use]
    pub fn render_output(&self, stream: OutputStream) -> Option<String> {
        self.output().map(|output| output.render(stream))
    }

    /// Shell preamble sourcing the environment, activating the virtualenv
    /// and, when `in_folder`, entering the workspace.
    #[must_use]
    pub fn command_extras(&self, in_folder: bool) -> String {
        let project = &self.context.project;
        let venv = if project.use_venv {
            format!(
                "cd ~; {} -m venv --system-site-packages .venv; source .venv/bin/activate; cd - > /dev/null",
                project.interpreter
            )
        } else {
            String::from("echo skipping venv activation")
        };
        let mut extras = format!("source {}; {venv}; ", self.record.endpoint.env_file);
        if in_folder {
            extras.push_str(&format!("cd {}; ", project.remote_dir));
        }
        extras
    }

    /// Full remote shell line for `cmd`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::QuoteInCommand`] when `cmd` contains a single
    /// quote, which the rendered `ssh host '<line>'` form cannot carry.
    pub fn remote_command(&self, cmd: &str, in_folder: bool) -> Result<String, RemoteError> {
        if cmd.contains('\'') {
            return Err(RemoteError::QuoteInCommand {
                command: cmd.to_owned(),
            });
        }
        Ok(format!("{}{cmd}", self.command_extras(in_folder)))
    }

    /// Dependency installation command for the local workspace.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::MissingSetupDescriptor`] when the workspace has
    /// no installable package or requirements list.
    pub fn setup_command(&self) -> Result<String, RemoteError> {
        let project = &self.context.project;
        let descriptor = detect_setup(&project.source_dir)?;
        Ok(descriptor.install_command(&project.interpreter))
    }

    /// Builds the transfer of the workspace to this node.
    fn sync_request(&self, excludes: Vec<String>) -> SyncRequest {
        let project = &self.context.project;
        SyncRequest {
            source: project.source_dir.clone(),
            destination: self.record.endpoint.remote_path(&project.remote_dir),
            excludes,
        }
    }
}

impl<G: ProviderGateway, T: RemoteTransport> Node<G, T> {
    /// Replaces the record with a fresher one for the same instance.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::IdentityMismatch`] when the id or name differ.
    pub fn update(&mut self, record: InstanceRecord) -> NodeResult<(), G> {
        if record.id != self.record.id || record.name != self.record.name {
            return Err(FleetError::IdentityMismatch {
                expected: format!("{} ({})", self.record.name, self.record.id),
                found: format!("{} ({})", record.name, record.id),
            });
        }
        self.record = record;
        Ok(())
    }

    /// Runs `cmd` on the pod, streaming output into the node's buffer.
    ///
    /// Returns `Ok(None)` when the host key cannot be verified; the pod is
    /// terminated in that case. With `purge_after` the pod is terminated
    /// once the command ends, whatever its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Remote`] for quoting and transport failures and
    /// [`FleetError::TerminationFailed`] when a required removal fails.
    pub async fn run(
        &self,
        cmd: &str,
        in_folder: bool,
        purge_after: bool,
    ) -> NodeResult<Option<CommandOutput>, G> {
        let script = self.remote_command(cmd, in_folder)?;
        self.output
            .begin(cmd, self.context.settings.max_output_lines);
        let result = self
            .context
            .transport
            .exec(&self.record.endpoint, &script, &self.output)
            .await;

        match result {
            Ok(code) => self.output.finish(code),
            Err(RemoteError::HostKeyUnverifiable { host }) => {
                self.output.finish(None);
                warn!(
                    instance_id = %self.record.id,
                    name = %self.record.name,
                    host = %host,
                    "host key could not be verified; terminating pod"
                );
                self.remove().await?;
                return Ok(None);
            }
            Err(err) => {
                self.output.finish(None);
                if purge_after {
                    self.remove().await?;
                }
                return Err(err.into());
            }
        }

        if purge_after {
            self.remove().await?;
        }
        Ok(self.output())
    }

    /// Installs the workspace dependencies on the pod.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Remote`] when no setup descriptor exists, plus
    /// any error of [`Node::run`].
    pub async fn setup(&self) -> NodeResult<Option<CommandOutput>, G> {
        let command = self.setup_command()?;
        self.run(&command, true, false).await
    }

    /// Starts synchronising the workspace to the pod in the background.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the ignore files cannot be layered.
    pub fn sync_folder(&self) -> Result<SyncHandle, RemoteError> {
        let excludes = exclude_list(&self.context.project.source_dir)?;
        Ok(self.sync_with_excludes(excludes))
    }

    pub(crate) fn sync_with_excludes(&self, excludes: Vec<String>) -> SyncHandle {
        let request = self.sync_request(excludes);
        let node = self.clone();
        let handle = tokio::spawn(async move {
            node.context
                .transport
                .sync(&node.record.endpoint, &request)
                .await
        });
        SyncHandle {
            host: self.record.endpoint.host.clone(),
            handle,
        }
    }

    /// Terminates the pod, retrying once, and records it in the purge log.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::TerminationFailed`] when the retry fails too.
    pub async fn remove(&self) -> NodeResult<(), G> {
        let gateway = &self.context.gateway;
        let id = self.record.id.as_str();
        if let Err(err) = gateway.terminate_instance(id).await {
            warn!(instance_id = id, error = %err, "termination failed; retrying once");
            gateway
                .terminate_instance(id)
                .await
                .map_err(|source| FleetError::TerminationFailed {
                    id: id.to_owned(),
                    source,
                })?;
        }
        self.context.purged.record(id);
        info!(instance_id = id, name = %self.record.name, "terminated pod");
        Ok(())
    }
}

/// Handle to a background workspace transfer.
#[derive(Debug)]
pub struct SyncHandle {
    host: String,
    handle: JoinHandle<Result<(), RemoteError>>,
}

impl SyncHandle {
    /// Host the transfer targets.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Waits for the transfer to finish.
    ///
    /// # Errors
    ///
    /// Propagates the transport error, or [`RemoteError::SyncAborted`] when
    /// the task panicked or was cancelled.
    pub async fn join(self) -> Result<(), RemoteError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(RemoteError::SyncAborted {
                host: self.host,
                message: err.to_string(),
            }),
        }
    }

    /// Cancels the transfer locally.
    pub fn abort(&self) {
        self.handle.abort();
    }
}
