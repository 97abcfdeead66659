//! Errors raised by provider backends.

use thiserror::Error;

/// Errors surfaced while talking to a provider's command-line client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when the client binary cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the client exits unsuccessfully or reports an error on
    /// stderr.
    #[error("{command} failed with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program and operation that were attempted, e.g.
        /// `runpodctl remove pod`.
        command: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when the listing output cannot be parsed at all.
    #[error("could not parse {program} output: {message}")]
    Parse {
        /// Program whose output was parsed.
        program: String,
        /// Description of the problem.
        message: String,
    },
    /// Raised when a create call succeeds without reporting an id.
    #[error("create acknowledged without an instance id: {output}")]
    MissingCreatedId {
        /// Raw output of the create call.
        output: String,
    },
}

impl ProviderError {
    pub(crate) fn failure(
        program: &str,
        action: &str,
        code: Option<i32>,
        stderr: &str,
    ) -> Self {
        Self::CommandFailure {
            command: format!("{program} {action}"),
            status_text: code.map_or_else(|| String::from("unknown"), |value| value.to_string()),
            stderr: stderr.trim().to_owned(),
        }
    }

    pub(crate) fn parse(program: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            program: program.to_owned(),
            message: message.into(),
        }
    }
}
