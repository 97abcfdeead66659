//! Parser for the tab-separated table printed by `runpodctl get pod -a`.

use tracing::warn;

use crate::instance::{InstanceRecord, PodName, Resources, SshEndpoint};
use crate::provider::{DegradedInstance, ProviderError, Snapshot};

/// Remote shell conventions of RunPod images.
pub(super) const RUNPOD_USER: &str = "root";
pub(super) const RUNPOD_HOME: &str = "/root";
pub(super) const RUNPOD_ENV_FILE: &str = "/etc/rp_environment";

const HEADER_MARKER: &str = "\tPORTS";
const SSH_PORT: u16 = 22;

/// One `ip:port->dst (pub,tcp)` entry of the ports column.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct PortMapping {
    pub(super) ip: String,
    pub(super) port: u16,
    pub(super) dst_port: u16,
    pub(super) public: bool,
    pub(super) protocol: String,
}

impl PortMapping {
    fn parse(entry: &str) -> Result<Self, String> {
        let cleaned = entry.trim().trim_end_matches(')');
        let (address, flags) = cleaned
            .split_once('(')
            .ok_or_else(|| format!("port entry `{entry}` has no visibility flags"))?;
        let (visibility, protocol) = flags
            .split_once(',')
            .ok_or_else(|| format!("port entry `{entry}` has malformed flags"))?;
        let (host_port, dst) = address
            .trim_matches(|c: char| c.is_whitespace() || c == '\u{a0}')
            .split_once("->")
            .ok_or_else(|| format!("port entry `{entry}` has no `->` mapping"))?;
        let (ip, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| format!("port entry `{entry}` has no host port"))?;
        Ok(Self {
            ip: ip.trim().to_owned(),
            port: parse_port(port, entry)?,
            dst_port: parse_port(dst, entry)?,
            public: visibility.trim() == "pub",
            protocol: protocol.trim().to_owned(),
        })
    }

    fn is_public_ssh(&self) -> bool {
        self.public && self.protocol == "tcp" && self.dst_port == SSH_PORT
    }
}

fn parse_port(text: &str, entry: &str) -> Result<u16, String> {
    text.trim_matches(|c: char| c.is_whitespace() || c == '\u{a0}')
        .parse()
        .map_err(|_| format!("port entry `{entry}` has an invalid port `{text}`"))
}

/// Splits the ports column into individual mappings.
pub(super) fn parse_ports(column: &str) -> Result<Vec<PortMapping>, String> {
    let trimmed = column.trim();
    if trimmed.is_empty() {
        return Err(String::from("no ports assigned yet"));
    }
    trimmed.split("),").map(PortMapping::parse).collect()
}

/// Picks the single public TCP mapping for port 22.
pub(super) fn select_ssh(mappings: &[PortMapping]) -> Result<&PortMapping, String> {
    let mut candidates = mappings.iter().filter(|mapping| mapping.is_public_ssh());
    match (candidates.next(), candidates.next()) {
        (Some(mapping), None) => Ok(mapping),
        (None, _) => Err(String::from("no public tcp endpoint for port 22")),
        (Some(_), Some(_)) => Err(String::from(
            "more than one public tcp endpoint for port 22",
        )),
    }
}

/// Parses the full listing.
///
/// # Errors
///
/// Returns [`ProviderError::Parse`] when the header cannot be located in
/// non-empty output. Individual rows never fail the listing.
pub(super) fn parse_pod_table(
    program: &str,
    text: &str,
    key_path: Option<&str>,
) -> Result<Snapshot, ProviderError> {
    let mut sections = text.split(HEADER_MARKER);
    let preamble = sections.next().unwrap_or_default();
    let Some(body) = sections.next() else {
        if preamble.trim().is_empty() {
            return Ok(Snapshot::default());
        }
        return Err(ProviderError::parse(program, "pod table header not found"));
    };
    if sections.next().is_some() {
        return Err(ProviderError::parse(program, "pod table header repeated"));
    }

    let mut snapshot = Snapshot::default();
    for line in body.lines().skip(1).filter(|line| !line.trim().is_empty()) {
        match parse_row(line, key_path) {
            Row::Parsed(record) => snapshot.instances.push(*record),
            Row::Degraded(entry) => {
                warn!(instance_id = %entry.id, name = %entry.name, reason = %entry.reason, "pod listed without a usable ssh endpoint");
                snapshot.degraded.push(entry);
            }
            Row::Unreadable => warn!(line, "skipping unreadable pod table row"),
        }
    }
    Ok(snapshot)
}

enum Row {
    Parsed(Box<InstanceRecord>),
    Degraded(DegradedInstance),
    Unreadable,
}

fn parse_row(line: &str, key_path: Option<&str>) -> Row {
    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    let field = |index: usize| fields.get(index).copied().unwrap_or_default();
    let id = field(0);
    let name = field(1);
    if id.is_empty() || name.is_empty() {
        return Row::Unreadable;
    }

    let degraded = |reason: String| {
        Row::Degraded(DegradedInstance {
            id: id.to_owned(),
            name: name.to_owned(),
            reason,
        })
    };
    let mappings = match parse_ports(field(11)) {
        Ok(mappings) => mappings,
        Err(reason) => return degraded(reason),
    };
    let ssh = match select_ssh(&mappings) {
        Ok(mapping) => mapping,
        Err(reason) => return degraded(reason),
    };

    let (gpu_count, gpu_type) = field(2)
        .split_once(' ')
        .map_or((None, field(2)), |(count, model)| (count.parse().ok(), model));
    Row::Parsed(Box::new(InstanceRecord {
        id: id.to_owned(),
        name: PodName::parse(name),
        status: field(4).to_owned(),
        endpoint: SshEndpoint {
            host: ssh.ip.clone(),
            port: ssh.port,
            user: RUNPOD_USER.to_owned(),
            key_path: key_path.map(str::to_owned),
            home_dir: RUNPOD_HOME.to_owned(),
            env_file: RUNPOD_ENV_FILE.to_owned(),
        },
        resources: Resources {
            vcpu: field(6).parse().ok(),
            memory_gb: field(7).parse().ok(),
            gpu_type: non_empty(gpu_type.trim()),
            gpu_count,
            disk_gb: field(8).parse().ok(),
            volume_gb: field(9).parse().ok(),
            instance_type: non_empty(field(5)),
            image: non_empty(field(3)),
            hourly_cost: non_empty(field(10)),
        },
    }))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

/// Extracts the id from `pod "<id>" created`.
pub(super) fn parse_created_id(stdout: &str) -> Option<String> {
    let (_, rest) = stdout.split_once("pod \"")?;
    let (id, _) = rest.split_once("\" created")?;
    non_empty(id.trim())
}
