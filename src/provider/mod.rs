//! Cloud provider abstraction: list, create and terminate instances.
//!
//! Backends drive the provider's own command-line client through a
//! [`CommandRunner`], which keeps them testable with scripted outputs.

use std::future::Future;
use std::pin::Pin;

use crate::instance::InstanceRecord;

pub mod aws;
mod error;
mod process;
pub mod runpod;

pub use aws::AwsGateway;
pub use error::ProviderError;
pub use process::{CommandRunner, ProcessCommandRunner, ProcessOutput, RunnerFuture};
pub use runpod::RunPodGateway;

/// Boxed future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// An instance the provider reported but whose SSH endpoint could not be
/// determined.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DegradedInstance {
    /// Provider-assigned identifier.
    pub id: String,
    /// Display name as reported.
    pub name: String,
    /// Why the entry could not be turned into an [`InstanceRecord`].
    pub reason: String,
}

/// One full listing of the instances owned by this tool.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    /// Fully parsed instances.
    pub instances: Vec<InstanceRecord>,
    /// Owned instances whose entry could only be partially parsed.
    pub degraded: Vec<DegradedInstance>,
    /// Identifiers of instances filtered out as not owned by this tool.
    pub foreign: Vec<String>,
}

impl Snapshot {
    /// Looks up a parsed instance by id.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|record| record.id == id)
    }

    /// Returns `true` when `id` is listed, parsed or degraded.
    #[must_use]
    pub fn lists(&self, id: &str) -> bool {
        self.find(id).is_some() || self.degraded.iter().any(|entry| entry.id == id)
    }

    /// Restricts the snapshot to instances whose name belongs to `group`.
    #[must_use]
    pub fn in_group(mut self, group: &str) -> Self {
        self.instances.retain(|record| record.name.in_group(group));
        self.degraded
            .retain(|entry| crate::instance::PodName::parse(&entry.name).in_group(group));
        self
    }
}

/// Per-request adjustments applied over a backend's configured defaults.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceOverrides {
    /// Memory in gigabytes.
    pub memory_gb: Option<u32>,
    /// Virtual CPU count.
    pub vcpu: Option<u32>,
    /// GPU count.
    pub gpu_count: Option<u32>,
    /// Disk or volume size in gigabytes.
    pub disk_gb: Option<u32>,
    /// Boot image.
    pub image: Option<String>,
}

/// Request to create a single instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateRequest {
    /// Display name to assign, normally `{group}_{index}`.
    pub name: String,
    /// Resource adjustments for this instance.
    pub overrides: ResourceOverrides,
}

/// Contract every cloud backend implements.
///
/// `create_instance` returns as soon as the provider acknowledges the
/// request; the instance shows up in a later listing. `list_instances` must
/// not fail because of one malformed entry: such entries go to
/// [`Snapshot::degraded`].
pub trait ProviderGateway: Send + Sync + 'static {
    /// Backend-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lists all instances owned by this tool.
    fn list_instances<'a>(
        &'a self,
        region: Option<&'a str>,
    ) -> ProviderFuture<'a, Snapshot, Self::Error>;

    /// Requests a new instance and returns its provider id.
    fn create_instance<'a>(
        &'a self,
        request: &'a CreateRequest,
    ) -> ProviderFuture<'a, String, Self::Error>;

    /// Terminates an instance. Callers retry on failure.
    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Region passed to [`ProviderGateway::list_instances`] by the fleet.
    fn region(&self) -> Option<&str> {
        None
    }
}
