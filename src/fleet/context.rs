//! Shared context threaded through a fleet and its nodes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::output::DEFAULT_MAX_LINES;

/// Local workspace and its remote counterpart.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Project {
    /// Local directory synchronised to every pod.
    pub source_dir: Utf8PathBuf,
    /// Workspace directory name under the remote home directory.
    pub remote_dir: String,
    /// Interpreter used for `py` commands.
    pub interpreter: String,
    /// Whether remote commands activate `~/.venv` first.
    pub use_venv: bool,
}

/// Timing and capacity limits of fleet operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FleetSettings {
    /// Lines retained per output stream and node.
    pub max_output_lines: usize,
    /// Poll interval of [`crate::Fleet::wait_pending`].
    pub pending_poll_interval: Duration,
    /// Upper bound on a single pending wait.
    pub pending_timeout: Duration,
    /// Default monitor tick.
    pub monitor_tick: Duration,
    /// Delay between failed listing attempts.
    pub list_retry_interval: Duration,
    /// Listing attempts before the last error is returned.
    pub list_max_attempts: u32,
    /// Attempts after which tracked instances without a usable endpoint are
    /// terminated.
    pub purge_failing_after: u32,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            max_output_lines: DEFAULT_MAX_LINES,
            pending_poll_interval: Duration::from_millis(100),
            pending_timeout: Duration::from_secs(1800),
            monitor_tick: Duration::from_secs(5),
            list_retry_interval: Duration::from_secs(1),
            list_max_attempts: 100,
            purge_failing_after: 30,
        }
    }
}

/// Append-only record of instance ids terminated by this process.
///
/// Nodes write to it when they remove themselves; fleets read it to drop
/// pending ids and evict nodes.
#[derive(Clone, Debug, Default)]
pub struct PurgeLog {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl PurgeLog {
    /// Records `id` as terminated.
    pub fn record(&self, id: &str) {
        self.lock().insert(id.to_owned());
    }

    /// Returns `true` when `id` was terminated.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    /// All recorded ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything a fleet and its nodes share: the provider, the transport, the
/// workspace, limits and the purge log.
#[derive(Debug)]
pub struct FleetContext<G, T> {
    /// Provider backend.
    pub gateway: G,
    /// Remote transport.
    pub transport: T,
    /// Workspace description.
    pub project: Project,
    /// Timing and capacity limits.
    pub settings: FleetSettings,
    /// Terminated ids.
    pub purged: PurgeLog,
}

impl<G, T> FleetContext<G, T> {
    /// Bundles a context with an empty purge log.
    #[must_use]
    pub fn new(gateway: G, transport: T, project: Project, settings: FleetSettings) -> Self {
        Self {
            gateway,
            transport,
            project,
            settings,
            purged: PurgeLog::default(),
        }
    }
}
