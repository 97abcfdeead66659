//! Core library for the podfleet tool.
//!
//! The crate keeps a fleet of rented GPU pods in step with the provider's
//! own listing and fans shell commands and workspace transfers out across
//! them. Providers are reached through their command-line clients
//! (`runpodctl`, `aws`) behind [`ProviderGateway`]; pods are reached through
//! the system `ssh` and `rsync` behind [`remote::RemoteTransport`].
//!
//! The usual flow is [`Fleet::discover`], optionally
//! [`Fleet::make_new_pods`], then [`Fleet::run`], [`Fleet::sync`],
//! [`Fleet::setup`] or [`Fleet::prune`], which all wait for pending pods
//! first.

pub mod config;
mod executor;
pub mod fleet;
pub mod instance;
pub mod node;
pub mod output;
pub mod provider;
pub mod remote;
pub mod test_support;
mod util;

pub use config::{AwsConfig, ConfigError, FleetConfig, ProviderKind, RunPodConfig};
pub use executor::{
    Commands, FanOutReport, Monitor, NodeOutcome, NodeProgress, NodeReport, PruneReport,
    SetupReport, SyncReport,
};
pub use fleet::{
    Fleet, FleetContext, FleetError, FleetSettings, Project, ReconcileReport, Selector,
};
pub use instance::{InstanceRecord, PodName, SshEndpoint};
pub use node::{Node, SyncHandle};
pub use output::{CommandOutput, OutputStream};
pub use provider::{
    AwsGateway, ProviderError, ProviderGateway, ResourceOverrides, RunPodGateway, Snapshot,
};
pub use remote::{RemoteError, SshOptions, SshTransport};
