//! Provider-neutral description of a single leased instance.
//!
//! Records are value objects: every poll of the provider yields fresh
//! records and a [`crate::Node`] swaps its record wholesale instead of
//! patching fields.

use std::fmt;

use tracing::debug;

/// Display name of a pod, following the `{group}_{index}` convention.
///
/// Names that do not follow the convention are kept verbatim so that
/// listing never fails on foreign naming.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum PodName {
    /// Name of the form `{group}_{index}`.
    Grouped {
        /// Group namespace prefix.
        group: String,
        /// Numeric suffix within the group.
        index: u32,
    },
    /// Name that could not be split into group and index.
    Unparsed(String),
}

impl PodName {
    /// Builds a grouped name.
    #[must_use]
    pub fn grouped(group: impl Into<String>, index: u32) -> Self {
        Self::Grouped {
            group: group.into(),
            index,
        }
    }

    /// Parses a display name, falling back to [`PodName::Unparsed`].
    ///
    /// The index must be the canonical decimal rendering of a `u32` so that
    /// the parsed name always renders back to the original text.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some((group, digits)) = raw.rsplit_once('_')
            && !group.is_empty()
            && let Ok(index) = digits.parse::<u32>()
            && index.to_string() == digits
        {
            return Self::grouped(group, index);
        }
        debug!(name = raw, "pod name does not follow group_index convention");
        Self::Unparsed(raw.to_owned())
    }

    /// Group prefix, when the name could be parsed.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Grouped { group, .. } => Some(group),
            Self::Unparsed(_) => None,
        }
    }

    /// Numeric index, when the name could be parsed.
    #[must_use]
    pub const fn index(&self) -> Option<u32> {
        match self {
            Self::Grouped { index, .. } => Some(*index),
            Self::Unparsed(_) => None,
        }
    }

    /// Returns `true` when the name belongs to `group`.
    #[must_use]
    pub fn in_group(&self, group: &str) -> bool {
        self.group() == Some(group)
    }
}

impl fmt::Display for PodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grouped { group, index } => write!(f, "{group}_{index}"),
            Self::Unparsed(raw) => f.write_str(raw),
        }
    }
}

/// SSH-reachable endpoint of an instance plus the remote shell conventions
/// of its image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshEndpoint {
    /// Public host name or IP address.
    pub host: String,
    /// TCP port the SSH daemon listens on.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key to authenticate with; `None` defers to the SSH client.
    pub key_path: Option<String>,
    /// Home directory of `user` on the remote host.
    pub home_dir: String,
    /// Environment file sourced before every remote command.
    pub env_file: String,
}

impl SshEndpoint {
    /// Returns `user@host`.
    #[must_use]
    pub fn ssh_target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Absolute remote path of a workspace directory under the home
    /// directory.
    #[must_use]
    pub fn remote_path(&self, remote_dir: &str) -> String {
        format!("{}/{remote_dir}", self.home_dir.trim_end_matches('/'))
    }
}

/// Resource descriptors reported by the provider. All fields are optional
/// because each backend reports a different subset.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Resources {
    /// Virtual CPU count.
    pub vcpu: Option<u32>,
    /// Memory in gigabytes.
    pub memory_gb: Option<u32>,
    /// GPU model name.
    pub gpu_type: Option<String>,
    /// Number of attached GPUs.
    pub gpu_count: Option<u32>,
    /// Container or root disk size in gigabytes.
    pub disk_gb: Option<u32>,
    /// Persistent volume size in gigabytes.
    pub volume_gb: Option<u32>,
    /// Provider machine type, e.g. `g5.xlarge`.
    pub instance_type: Option<String>,
    /// Boot image or AMI.
    pub image: Option<String>,
    /// Hourly cost as reported, kept as text.
    pub hourly_cost: Option<String>,
}

/// Snapshot of one instance as seen by the provider at poll time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRecord {
    /// Provider-assigned identifier, unique across the account.
    pub id: String,
    /// Display name.
    pub name: PodName,
    /// Free-text lifecycle status as reported by the provider.
    pub status: String,
    /// Where to reach the instance over SSH.
    pub endpoint: SshEndpoint,
    /// Reported resources.
    pub resources: Resources,
}

impl InstanceRecord {
    /// Returns `true` when the provider reports the instance as running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }
}
