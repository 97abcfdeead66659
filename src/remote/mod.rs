//! Remote execution and file synchronisation against a single endpoint.
//!
//! The [`RemoteTransport`] seam keeps nodes independent of the system `ssh`
//! and `rsync` clients so fan-out behaviour can be exercised with scripted
//! transports.

use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::instance::SshEndpoint;
use crate::output::SharedOutput;

mod ssh;
mod workspace;

pub use ssh::{HOST_KEY_FAILURE_MARKER, SshTransport};
pub use workspace::{
    EXTRA_IGNORE_FILE, GIT_IGNORE_FILE, INCLUDE_FILE, SetupDescriptor, detect_setup,
    exclude_list,
};

/// Boxed future returned by transport operations.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// SSH and rsync client settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `rsync` executable.
    pub rsync_bin: String,
    /// Whether to force batch mode to avoid password prompts.
    pub batch_mode: bool,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; empty leaves the client default.
    pub known_hosts_file: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            rsync_bin: String::from("rsync"),
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
        }
    }
}

/// One directory transfer to a remote workspace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncRequest {
    /// Local directory whose contents are sent.
    pub source: Utf8PathBuf,
    /// Absolute remote destination directory.
    pub destination: String,
    /// Patterns passed to rsync as `--exclude`.
    pub excludes: Vec<String>,
}

/// Transport used by nodes to reach their instance.
pub trait RemoteTransport: Send + Sync + 'static {
    /// Runs `command` through a remote shell, appending output lines to
    /// `sink` as they arrive. Returns the exit status.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::HostKeyUnverifiable`] when the host identity
    /// cannot be verified, or a spawn/IO error when the client fails.
    fn exec<'a>(
        &'a self,
        endpoint: &'a SshEndpoint,
        command: &'a str,
        sink: &'a SharedOutput,
    ) -> RemoteFuture<'a, Option<i32>>;

    /// Synchronises a local directory to the endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::SyncFailure`] when the transfer fails.
    fn sync<'a>(
        &'a self,
        endpoint: &'a SshEndpoint,
        request: &'a SyncRequest,
    ) -> RemoteFuture<'a, ()>;
}

/// Errors raised while working against one remote endpoint.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when a client binary cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when reading the client's output fails.
    #[error("i/o error while running {program}: {message}")]
    Io {
        /// Program whose streams failed.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the remote host key cannot be verified. Never retried.
    #[error("host key verification failed for {host}")]
    HostKeyUnverifiable {
        /// Host that failed verification.
        host: String,
    },
    /// Raised when a command contains a single quote, which the remote
    /// quoting cannot carry.
    #[error("remote commands cannot contain single quotes: {command}")]
    QuoteInCommand {
        /// Offending command.
        command: String,
    },
    /// Raised when an include entry does not match any excluded path.
    #[error("{file} lists `{entry}`, which is not excluded by any ignore file")]
    UnknownInclude {
        /// Include file name.
        file: String,
        /// Entry that matched nothing.
        entry: String,
    },
    /// Raised when an ignore or include file cannot be read.
    #[error("failed to read {path}: {message}")]
    WorkspaceRead {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the workspace has neither an installable package nor a
    /// requirements list.
    #[error("no setup.py, pyproject.toml or requirements.txt in {path}")]
    MissingSetupDescriptor {
        /// Workspace that was inspected.
        path: Utf8PathBuf,
    },
    /// Raised when the sync source directory does not exist.
    #[error("sync source directory missing: {path}")]
    MissingSource {
        /// Path that was expected to be synchronised.
        path: Utf8PathBuf,
    },
    /// Raised when `rsync` exits unsuccessfully.
    #[error("{program} exited with status {status_text}: {stderr}")]
    SyncFailure {
        /// Program used for the transfer.
        program: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when a background sync task panics or is aborted.
    #[error("sync task for {host} did not complete: {message}")]
    SyncAborted {
        /// Host of the interrupted transfer.
        host: String,
        /// Join error description.
        message: String,
    },
}

#[cfg(test)]
mod tests;
