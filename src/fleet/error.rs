//! Errors surfaced by fleet bookkeeping and fan-out.

use thiserror::Error;

use crate::remote::RemoteError;

/// Errors surfaced while managing a fleet.
///
/// Generic over the provider's error type so callers keep the backend's own
/// diagnostics.
#[derive(Debug, Error)]
pub enum FleetError<ProviderErr>
where
    ProviderErr: std::error::Error + 'static,
{
    /// Raised when a provider call fails outright.
    #[error("provider request failed: {0}")]
    Provider(#[source] ProviderErr),
    /// Raised when listing keeps failing past the attempt budget.
    #[error("listing instances failed after {attempts} attempts")]
    ListingExhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// Last listing error.
        #[source]
        source: ProviderErr,
    },
    /// Raised when termination fails on the retry as well.
    #[error("failed to terminate {id} after retrying")]
    TerminationFailed {
        /// Instance that could not be terminated.
        id: String,
        /// Error of the final attempt.
        #[source]
        source: ProviderErr,
    },
    /// Raised when a node with the same id is already tracked.
    #[error("instance {id} is already tracked")]
    DuplicateId {
        /// Offending id.
        id: String,
    },
    /// Raised when a node with the same name is already tracked.
    #[error("a pod named {name} is already tracked")]
    DuplicateName {
        /// Offending name.
        name: String,
    },
    /// Raised when a refreshed record does not describe the same instance.
    #[error("record for {expected} was replaced by {found}")]
    IdentityMismatch {
        /// `name (id)` of the tracked record.
        expected: String,
        /// `name (id)` of the replacement.
        found: String,
    },
    /// Raised when per-node commands do not line up with the nodes.
    #[error("{commands} commands were given for {nodes} pods")]
    CommandCountMismatch {
        /// Number of commands supplied.
        commands: usize,
        /// Number of nodes in the fleet.
        nodes: usize,
    },
    /// Raised when pending creations do not materialise in time.
    #[error("pods {pending:?} were still pending after {waited_secs}s")]
    PendingTimeout {
        /// Ids still pending.
        pending: Vec<String>,
        /// Seconds waited.
        waited_secs: u64,
    },
    /// Raised when instances are still listed after a purge.
    #[error("purge left instances behind: {remaining:?}")]
    PurgeIncomplete {
        /// Ids still reported by the provider.
        remaining: Vec<String>,
    },
    /// Raised when a selection matches no pod.
    #[error("no pod matches `{selector}`")]
    UnknownSelection {
        /// Selector as given.
        selector: String,
    },
    /// Raised for remote failures that are fatal to the caller, such as a
    /// quote in a command or a missing setup descriptor.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}
