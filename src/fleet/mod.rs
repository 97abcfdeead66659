//! Fleet registry: tracked nodes, pending creations and reconciliation
//! against the provider's listing.
//!
//! Each tracked id moves through `pending → node → removed`. Reconciliation
//! never drops a node on its own: a node missing from a listing is
//! quarantined (skipped by fan-out) until it reappears or the operator
//! calls [`Fleet::forget_vanished`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::instance::{InstanceRecord, PodName};
use crate::node::{Node, NodeResult};
use crate::provider::{CreateRequest, ProviderGateway, ResourceOverrides, Snapshot};
use crate::remote::RemoteTransport;

mod context;
mod error;

pub use context::{FleetContext, FleetSettings, Project, PurgeLog};
pub use error::FleetError;

/// Group used for new pods when the fleet has no group filter.
pub const DEFAULT_GROUP: &str = "pod";

/// Picks a subset of a fleet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Selector {
    /// Position in the fleet.
    Index(usize),
    /// Half-open range of positions; open ends extend to the fleet's edge.
    Range {
        /// First position, inclusive.
        start: Option<usize>,
        /// Last position, exclusive.
        end: Option<usize>,
    },
    /// Pod name or provider id.
    Name(String),
}

impl FromStr for Selector {
    type Err = std::convert::Infallible;

    /// Parses `3`, `1-4`, `-2`, `3-`, or falls back to a name.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let trimmed = text.trim();
        if let Ok(index) = trimmed.parse::<usize>() {
            return Ok(Self::Index(index));
        }
        if let Some((start, end)) = trimmed.split_once('-')
            && (!start.is_empty() || !end.is_empty())
            && let (Ok(first), Ok(last)) = (parse_bound(start), parse_bound(end))
        {
            return Ok(Self::Range {
                start: first,
                end: last,
            });
        }
        Ok(Self::Name(trimmed.to_owned()))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Range { start, end } => {
                if let Some(first) = start {
                    write!(f, "{first}")?;
                }
                f.write_str("-")?;
                if let Some(last) = end {
                    write!(f, "{last}")?;
                }
                Ok(())
            }
            Self::Name(name) => f.write_str(name),
        }
    }
}

fn parse_bound(text: &str) -> Result<Option<usize>, std::num::ParseIntError> {
    if text.is_empty() {
        return Ok(None);
    }
    text.parse().map(Some)
}

/// Outcome of one reconciliation pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReconcileReport {
    /// Listed ids that are neither tracked nor pending.
    pub unexpected: Vec<String>,
    /// Tracked ids missing from the listing.
    pub vanished: Vec<String>,
    /// Quarantined ids listed again.
    pub reappeared: Vec<String>,
    /// Tracked nodes whose record was refreshed.
    pub updated: usize,
    /// Pending ids promoted to nodes.
    pub materialized: Vec<String>,
}

/// Registry of the pods one invocation operates on.
pub struct Fleet<G, T> {
    context: Arc<FleetContext<G, T>>,
    group: Option<String>,
    creation: ResourceOverrides,
    nodes: Vec<Node<G, T>>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    pending: Vec<String>,
    vanished: HashSet<String>,
    is_subset: bool,
}

impl<G, T> std::fmt::Debug for Fleet<G, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("group", &self.group)
            .field("nodes", &self.nodes)
            .field("pending", &self.pending)
            .field("vanished", &self.vanished)
            .field("is_subset", &self.is_subset)
            .finish_non_exhaustive()
    }
}

impl<G, T> Fleet<G, T> {
    /// Creates an empty fleet.
    #[must_use]
    pub fn new(
        context: Arc<FleetContext<G, T>>,
        group: Option<String>,
        creation: ResourceOverrides,
    ) -> Self {
        Self {
            context,
            group,
            creation,
            nodes: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            pending: Vec::new(),
            vanished: HashSet::new(),
            is_subset: false,
        }
    }

    /// Shared context.
    #[must_use]
    pub const fn context(&self) -> &Arc<FleetContext<G, T>> {
        &self.context
    }

    /// Group filter, if any.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Resource overrides applied to new pods.
    #[must_use]
    pub const fn creation(&self) -> &ResourceOverrides {
        &self.creation
    }

    /// Tracked nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[Node<G, T>] {
        &self.nodes
    }

    /// Number of tracked nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` when no node is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Creation ids not yet seen in a listing.
    #[must_use]
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Returns `true` when `id` is quarantined.
    #[must_use]
    pub fn is_vanished(&self, id: &str) -> bool {
        self.vanished.contains(id)
    }

    /// Returns `true` when this fleet is a selection of a larger one.
    #[must_use]
    pub const fn is_subset(&self) -> bool {
        self.is_subset
    }

    /// Looks up a node by provider id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Node<G, T>> {
        self.by_id.get(id).and_then(|&index| self.nodes.get(index))
    }

    /// Looks up a node by display name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&Node<G, T>> {
        self.by_name.get(name).and_then(|&index| self.nodes.get(index))
    }

    /// Tracks a new node.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::DuplicateId`] or [`FleetError::DuplicateName`]
    /// without modifying the fleet when either key is already tracked.
    pub fn insert(&mut self, node: Node<G, T>) -> NodeResult<(), G>
    where
        G: ProviderGateway,
    {
        let id = node.id().to_owned();
        let name = node.name().to_string();
        if self.by_id.contains_key(&id) {
            return Err(FleetError::DuplicateId { id });
        }
        if self.by_name.contains_key(&name) {
            return Err(FleetError::DuplicateName { name });
        }
        let position = self.nodes.len();
        self.nodes.push(node);
        self.by_id.insert(id.clone(), position);
        self.by_name.insert(name, position);
        if let Some(index) = self.pending.iter().position(|pending| *pending == id) {
            self.pending.remove(index);
            info!(instance_id = %id, still_pending = self.pending.len(), "pod initialised");
        }
        Ok(())
    }

    /// Stops tracking `id`, returning its node.
    pub fn evict(&mut self, id: &str) -> Option<Node<G, T>> {
        let index = self.by_id.get(id).copied()?;
        if index >= self.nodes.len() {
            return None;
        }
        let node = self.nodes.remove(index);
        self.vanished.remove(id);
        self.rebuild_indices();
        Some(node)
    }

    fn rebuild_indices(&mut self) {
        self.by_id = self
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.id().to_owned(), index))
            .collect();
        self.by_name = self
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.name().to_string(), index))
            .collect();
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.by_id.clear();
        self.by_name.clear();
        self.vanished.clear();
    }

    /// Evicts every quarantined node and returns their ids.
    pub fn forget_vanished(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.vanished.iter().cloned().collect();
        ids.sort();
        for id in &ids {
            self.evict(id);
            warn!(instance_id = %id, "forgot vanished pod");
        }
        ids
    }

    /// Returns `false`, with a warning, for quarantined nodes.
    pub(crate) fn is_dispatchable(&self, node: &Node<G, T>) -> bool {
        let quarantined = self.vanished.contains(node.id());
        if quarantined {
            warn!(instance_id = %node.id(), name = %node.name(), "skipping vanished pod");
        }
        !quarantined
    }

    /// Nodes eligible for fan-out: tracked and not quarantined.
    pub(crate) fn active_nodes(&self) -> Vec<Node<G, T>> {
        self.nodes
            .iter()
            .filter(|node| self.is_dispatchable(node))
            .cloned()
            .collect()
    }

    /// Applies the purge log: pending ids are dropped and nodes evicted.
    pub(crate) fn drain_purged(&mut self) {
        let purged = self.context.purged.clone();
        self.pending.retain(|id| {
            let keep = !purged.contains(id);
            if !keep {
                info!(instance_id = %id, "dropping purged pod from pending");
            }
            keep
        });
        let evicted: Vec<String> = self
            .nodes
            .iter()
            .map(|node| node.id().to_owned())
            .filter(|id| purged.contains(id))
            .collect();
        for id in evicted {
            self.evict(&id);
            debug!(instance_id = %id, "evicted purged pod");
        }
    }

    fn scoped(&self, nodes: Vec<Node<G, T>>) -> Self {
        let vanished = nodes
            .iter()
            .filter(|node| self.vanished.contains(node.id()))
            .map(|node| node.id().to_owned())
            .collect();
        let mut subset = Self {
            context: Arc::clone(&self.context),
            group: self.group.clone(),
            creation: self.creation.clone(),
            nodes,
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            pending: Vec::new(),
            vanished,
            is_subset: true,
        };
        subset.rebuild_indices();
        subset
    }

    /// Returns a fleet scoped to the selected nodes, sharing this fleet's
    /// context, group and creation overrides.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownSelection`] when an index or name does
    /// not match.
    pub fn select(&self, selector: &Selector) -> NodeResult<Self, G>
    where
        G: ProviderGateway,
    {
        let unknown = || FleetError::UnknownSelection {
            selector: selector.to_string(),
        };
        let chosen = match selector {
            Selector::Index(index) => vec![self.nodes.get(*index).ok_or_else(unknown)?.clone()],
            Selector::Range { start, end } => {
                let last = end.unwrap_or(self.nodes.len()).min(self.nodes.len());
                let first = start.unwrap_or(0).min(last);
                self.nodes.get(first..last).unwrap_or_default().to_vec()
            }
            Selector::Name(name) => vec![
                self.by_name(name)
                    .or_else(|| self.get(name))
                    .ok_or_else(unknown)?
                    .clone(),
            ],
        };
        Ok(self.scoped(chosen))
    }

    /// Returns a fleet of the nodes whose latest record reports running.
    #[must_use]
    pub fn running(&self) -> Self {
        let alive = self
            .nodes
            .iter()
            .filter(|node| node.record().is_running())
            .cloned()
            .collect();
        self.scoped(alive)
    }

    /// Returns `true` when `id` is tracked or pending.
    fn tracks(&self, id: &str) -> bool {
        self.by_id.contains_key(id) || self.pending.iter().any(|pending| pending == id)
    }

    fn in_scope(&self, snapshot: Snapshot) -> Snapshot {
        let Some(group) = self.group.as_deref() else {
            return snapshot;
        };
        snapshot.in_group(group)
    }
}

impl<G: ProviderGateway, T: RemoteTransport> Fleet<G, T> {
    /// Builds a fleet tracking every listed pod of the group.
    ///
    /// # Errors
    ///
    /// Returns listing errors once retries are exhausted, and duplicate
    /// errors when the provider lists a name twice.
    pub async fn discover(
        context: Arc<FleetContext<G, T>>,
        group: Option<String>,
        creation: ResourceOverrides,
    ) -> NodeResult<Self, G> {
        let mut fleet = Self::new(context, group, creation);
        let snapshot = fleet.fetch_snapshot().await?;
        for record in snapshot.instances {
            let node = Node::new(record, Arc::clone(&fleet.context));
            fleet.insert(node)?;
        }
        info!(pods = fleet.len(), group = ?fleet.group, "discovered fleet");
        Ok(fleet)
    }

    /// Lists the group's instances, retrying failed listings and listings
    /// in which tracked instances have no usable endpoint yet.
    ///
    /// After `purge_failing_after` attempts, tracked instances that still
    /// have no endpoint are terminated and recorded in the purge log.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::ListingExhausted`] after `list_max_attempts`
    /// failed listings.
    pub async fn fetch_snapshot(&self) -> NodeResult<Snapshot, G> {
        let settings = self.context.settings;
        let gateway = &self.context.gateway;
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match gateway.list_instances(gateway.region()).await {
                Ok(listing) => {
                    let snapshot = self.in_scope(listing);
                    let failing: Vec<&str> = snapshot
                        .degraded
                        .iter()
                        .filter(|entry| self.tracks(&entry.id))
                        .map(|entry| entry.id.as_str())
                        .collect();
                    if failing.is_empty() {
                        return Ok(snapshot);
                    }
                    if attempt >= settings.purge_failing_after {
                        self.purge_failing(&failing).await?;
                        return Ok(snapshot);
                    }
                    warn!(
                        attempt,
                        failing = failing.len(),
                        "tracked pods have no usable ssh endpoint yet; listing again"
                    );
                }
                Err(err) => {
                    if attempt >= settings.list_max_attempts {
                        return Err(FleetError::ListingExhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    warn!(
                        attempt,
                        max_attempts = settings.list_max_attempts,
                        error = %err,
                        "listing instances failed; retrying"
                    );
                }
            }
            sleep(settings.list_retry_interval).await;
        }
    }

    async fn purge_failing(&self, ids: &[&str]) -> NodeResult<(), G> {
        let gateway = &self.context.gateway;
        for &id in ids {
            warn!(instance_id = id, "terminating pod that never exposed an ssh endpoint");
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
        }
        Ok(())
    }

    /// Refreshes the fleet against a new listing.
    ///
    /// # Errors
    ///
    /// Returns listing errors, [`FleetError::IdentityMismatch`] when a
    /// tracked id changes name, and duplicate errors when a pending pod
    /// collides with a tracked one.
    pub async fn reconcile(&mut self) -> NodeResult<ReconcileReport, G> {
        let snapshot = self.fetch_snapshot().await?;
        self.apply_snapshot(&snapshot)
    }

    /// Applies a listing to the fleet's bookkeeping.
    ///
    /// # Errors
    ///
    /// See [`Fleet::reconcile`].
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> NodeResult<ReconcileReport, G> {
        let got: HashMap<&str, &InstanceRecord> = snapshot
            .instances
            .iter()
            .map(|record| (record.id.as_str(), record))
            .collect();
        let mut report = ReconcileReport::default();

        if !self.is_subset {
            for record in &snapshot.instances {
                if !self.tracks(&record.id) {
                    warn!(instance_id = %record.id, name = %record.name, "unrecognised pod appeared");
                    report.unexpected.push(record.id.clone());
                }
            }
        }

        for node in &self.nodes {
            let id = node.id();
            if snapshot.lists(id) {
                if self.vanished.contains(id) {
                    info!(instance_id = id, name = %node.name(), "vanished pod is listed again");
                    report.reappeared.push(id.to_owned());
                }
            } else {
                warn!(instance_id = id, name = %node.name(), "pod disappeared from the listing");
                report.vanished.push(id.to_owned());
            }
        }
        for id in &report.reappeared {
            self.vanished.remove(id);
        }
        self.vanished.extend(report.vanished.iter().cloned());

        for node in &mut self.nodes {
            if let Some(&record) = got.get(node.id()) {
                node.update(record.clone())?;
                report.updated = report.updated.saturating_add(1);
            }
        }

        let finished: Vec<String> = self
            .pending
            .iter()
            .filter(|id| got.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in finished {
            if let Some(&record) = got.get(id.as_str()) {
                let node = Node::new(record.clone(), Arc::clone(&self.context));
                self.insert(node)?;
                report.materialized.push(id);
            }
        }
        Ok(report)
    }

    /// Reconciles until no creation is pending.
    ///
    /// Always reconciles at least once so dependent operations act on a
    /// fresh view. Ids in the purge log are dropped from pending and their
    /// nodes evicted.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::PendingTimeout`] when pods stay pending longer
    /// than the configured timeout, plus any reconciliation error.
    pub async fn wait_pending(&mut self) -> NodeResult<(), G> {
        let settings = self.context.settings;
        let deadline = Instant::now() + settings.pending_timeout;
        self.drain_purged();
        if !self.pending.is_empty() {
            info!(pending = self.pending.len(), "waiting for pods to initialise");
        }
        loop {
            self.reconcile().await?;
            self.drain_purged();
            if self.pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FleetError::PendingTimeout {
                    pending: self.pending.clone(),
                    waited_secs: settings.pending_timeout.as_secs(),
                });
            }
            debug!(pending = self.pending.len(), "pods still pending");
            sleep(settings.pending_poll_interval).await;
        }
    }

    /// Requests `count` new pods named after the next free indices of the
    /// group. Their ids join the pending set.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Provider`] when a create call fails; ids of
    /// pods requested before the failure stay pending.
    pub async fn make_new_pods(&mut self, count: u32) -> NodeResult<Vec<String>, G> {
        self.wait_pending().await?;
        let snapshot = self.fetch_snapshot().await?;
        let group = self.group.clone().unwrap_or_else(|| DEFAULT_GROUP.to_owned());
        let next = next_index(&group, &snapshot, self.nodes.iter().map(Node::name));

        let mut created = Vec::new();
        for offset in 0..count {
            let name = PodName::grouped(group.clone(), next.saturating_add(offset));
            let request = CreateRequest {
                name: name.to_string(),
                overrides: self.creation.clone(),
            };
            let id = self
                .context
                .gateway
                .create_instance(&request)
                .await
                .map_err(FleetError::Provider)?;
            info!(instance_id = %id, name = %name, "pod requested");
            self.pending.push(id.clone());
            created.push(id);
        }
        Ok(created)
    }

    /// Terminates every tracked pod, waits out pending creations and
    /// terminates those too, then checks the provider no longer lists them.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::TerminationFailed`] when a pod cannot be
    /// terminated and [`FleetError::PurgeIncomplete`] when the final listing
    /// still reports purged pods (or, for a whole-group fleet, any pod of
    /// the group).
    pub async fn purge(&mut self) -> NodeResult<(), G> {
        let mut terminated = self.terminate_tracked().await?;
        self.wait_pending().await?;
        terminated.extend(self.terminate_tracked().await?);

        let snapshot = self.fetch_snapshot().await?;
        let mut remaining: Vec<String> = if self.is_subset {
            terminated
                .iter()
                .filter(|id| snapshot.lists(id))
                .cloned()
                .collect()
        } else {
            snapshot
                .instances
                .iter()
                .map(|record| record.id.clone())
                .chain(snapshot.degraded.iter().map(|entry| entry.id.clone()))
                .collect()
        };
        remaining.sort();
        remaining.dedup();
        if !remaining.is_empty() {
            return Err(FleetError::PurgeIncomplete { remaining });
        }
        info!(terminated = terminated.len(), "purge complete");
        Ok(())
    }

    async fn terminate_tracked(&mut self) -> NodeResult<Vec<String>, G> {
        let nodes = std::mem::take(&mut self.nodes);
        self.clear();
        let mut terminated = Vec::with_capacity(nodes.len());
        for node in nodes {
            node.remove().await?;
            terminated.push(node.id().to_owned());
        }
        Ok(terminated)
    }
}

/// First free index of `group`, looking at listed and tracked names.
fn next_index<'a>(
    group: &str,
    snapshot: &Snapshot,
    tracked: impl Iterator<Item = &'a PodName>,
) -> u32 {
    let listed = snapshot
        .instances
        .iter()
        .map(|record| record.name.clone())
        .chain(
            snapshot
                .degraded
                .iter()
                .map(|entry| PodName::parse(&entry.name)),
        );
    listed
        .chain(tracked.cloned())
        .filter(|name| name.in_group(group))
        .filter_map(|name| name.index())
        .max()
        .map_or(0, |max| max.saturating_add(1))
}
