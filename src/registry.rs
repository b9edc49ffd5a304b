//! Tracks the roster of known agents and the link owned for each of them.
//!
//! Reconciliation is additive: entries are added or re-addressed, never
//! removed. Removal only happens through [`AgentRegistry::disconnect`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{CodecConfig, ConnectionConfig, GatewayConfig, LinkConfig};
use crate::connection::Endpoint;
use crate::link::AgentLink;
use crate::protocol::AgentId;
use crate::telemetry::AgentEvent;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent {0} appears more than once in the roster")]
    DuplicateAgent(AgentId),
    #[error("agent {id} has an invalid endpoint: {reason}")]
    InvalidEndpoint { id: AgentId, reason: String },
    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),
    #[error("agent {0} has no network address")]
    NoLink(AgentId),
    #[error("failed to read roster: {0}")]
    RosterIo(#[from] std::io::Error),
    #[error("failed to parse roster: {0}")]
    RosterJson(#[from] serde_json::Error),
}

/// Roster entry as persisted by the fleet server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEndpoint {
    pub id: AgentId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Overrides the configured agent port.
    #[serde(default)]
    pub port: Option<u16>,
}

impl AgentEndpoint {
    pub fn new(id: AgentId, ip_address: Option<&str>) -> Self {
        Self {
            id,
            name: format!("agent-{id}"),
            description: String::new(),
            ip_address: ip_address.map(str::to_string),
            port: None,
        }
    }

    /// Network address, if the entry has a usable one. Blank addresses count
    /// as absent.
    pub fn endpoint(&self, default_port: u16) -> Option<Endpoint> {
        let host = self.ip_address.as_deref().map(str::trim)?;
        if host.is_empty() {
            return None;
        }
        Some(Endpoint::new(host, self.port.unwrap_or(default_port)))
    }

    fn same_address(&self, other: &AgentEndpoint, default_port: u16) -> bool {
        self.endpoint(default_port) == other.endpoint(default_port)
    }
}

/// How an agent is named by callers of [`AgentRegistry::disconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSelector {
    Id(AgentId),
    /// Bare host or `host:port`.
    Address(String),
}

impl FromStr for AgentSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<AgentId>() {
            Ok(id) => AgentSelector::Id(id),
            Err(_) => AgentSelector::Address(s.to_string()),
        })
    }
}

impl fmt::Display for AgentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentSelector::Id(id) => write!(f, "agent {id}"),
            AgentSelector::Address(addr) => write!(f, "address {addr}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub connected: Vec<AgentId>,
    pub reconnected: Vec<AgentId>,
    pub updated: Vec<AgentId>,
    pub unchanged: Vec<AgentId>,
    /// Tracked without a link because no address is known.
    pub unaddressed: Vec<AgentId>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.connected.is_empty() && self.reconnected.is_empty() && self.updated.is_empty()
    }
}

/// Where rosters come from.
pub trait RosterSource: Send + Sync {
    fn load(&self) -> Result<Vec<AgentEndpoint>, RegistryError>;

    fn describe(&self) -> String;
}

/// JSON array of [`AgentEndpoint`]s on disk, re-read on every load.
#[derive(Debug, Clone)]
pub struct FileRoster {
    path: PathBuf,
}

impl FileRoster {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RosterSource for FileRoster {
    fn load(&self) -> Result<Vec<AgentEndpoint>, RegistryError> {
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticRoster(pub Vec<AgentEndpoint>);

impl RosterSource for StaticRoster {
    fn load(&self) -> Result<Vec<AgentEndpoint>, RegistryError> {
        Ok(self.0.clone())
    }

    fn describe(&self) -> String {
        format!("static roster ({} agents)", self.0.len())
    }
}

#[derive(Debug)]
struct TrackedAgent {
    entry: AgentEndpoint,
    link: Option<AgentLink>,
}

#[derive(Debug)]
pub struct AgentRegistry {
    connection: ConnectionConfig,
    codec: CodecConfig,
    link: LinkConfig,
    upstream: mpsc::Sender<AgentEvent>,
    agents: BTreeMap<AgentId, TrackedAgent>,
}

/// Reject rosters with duplicate ids or unusable addresses before touching
/// any link.
pub fn validate_roster(entries: &[AgentEndpoint]) -> Result<(), RegistryError> {
    let mut seen = BTreeSet::new();
    for entry in entries {
        if !seen.insert(entry.id) {
            return Err(RegistryError::DuplicateAgent(entry.id));
        }
        if entry.port == Some(0) {
            return Err(RegistryError::InvalidEndpoint {
                id: entry.id,
                reason: "port 0".to_string(),
            });
        }
        if let Some(host) = entry.ip_address.as_deref() {
            if host.chars().any(char::is_whitespace) && !host.trim().is_empty() {
                return Err(RegistryError::InvalidEndpoint {
                    id: entry.id,
                    reason: format!("'{host}' is not a host name"),
                });
            }
        }
    }
    Ok(())
}

impl AgentRegistry {
    pub fn new(config: &GatewayConfig, upstream: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            connection: config.connection.clone(),
            codec: config.codec.clone(),
            link: config.link.clone(),
            upstream,
            agents: BTreeMap::new(),
        }
    }

    fn spawn_link(&self, id: AgentId, endpoint: Endpoint) -> AgentLink {
        AgentLink::spawn(
            id,
            endpoint,
            &self.connection,
            &self.codec,
            &self.link,
            self.upstream.clone(),
        )
    }

    pub async fn reconcile(&mut self, entries: &[AgentEndpoint]) -> Result<ReconcileReport, RegistryError> {
        validate_roster(entries)?;
        let port = self.link.agent_port;
        let mut report = ReconcileReport::default();

        for entry in entries {
            let id = entry.id;
            if !self.agents.contains_key(&id) {
                let link = entry.endpoint(port).map(|ep| self.spawn_link(id, ep));
                if link.is_some() {
                    info!(agent_id = id, name = %entry.name, "agent added");
                    report.connected.push(id);
                } else {
                    debug!(agent_id = id, "agent has no address, not connecting");
                    report.unaddressed.push(id);
                }
                self.agents.insert(
                    id,
                    TrackedAgent {
                        entry: entry.clone(),
                        link,
                    },
                );
                continue;
            }
            let Some(tracked) = self.agents.get_mut(&id) else {
                continue;
            };

            if !tracked.entry.same_address(entry, port) {
                let old = tracked.link.take();
                tracked.entry = entry.clone();
                let endpoint = entry.endpoint(port);
                if let Some(old) = old {
                    old.shutdown().await;
                }
                let link = endpoint.map(|ep| self.spawn_link(id, ep));
                let has_link = link.is_some();
                if let Some(tracked) = self.agents.get_mut(&id) {
                    tracked.link = link;
                }
                if has_link {
                    info!(agent_id = id, "agent re-addressed, reconnecting");
                    report.reconnected.push(id);
                } else {
                    info!(agent_id = id, "agent address removed, link closed");
                    report.unaddressed.push(id);
                }
            } else if tracked.entry != *entry {
                tracked.entry = entry.clone();
                debug!(agent_id = id, "agent details updated");
                report.updated.push(id);
            } else {
                report.unchanged.push(id);
            }
        }

        Ok(report)
    }

    /// Track and connect a single agent. Returns whether a new link was
    /// started.
    pub async fn connect_to_agent(&mut self, entry: AgentEndpoint) -> Result<bool, RegistryError> {
        let report = self.reconcile(std::slice::from_ref(&entry)).await?;
        Ok(!report.connected.is_empty() || !report.reconnected.is_empty())
    }

    /// Close and forget every agent matching the selector.
    pub async fn disconnect(&mut self, selector: &AgentSelector) -> Vec<AgentId> {
        let port = self.link.agent_port;
        let matching: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|(id, tracked)| match selector {
                AgentSelector::Id(wanted) => *id == wanted,
                AgentSelector::Address(addr) => {
                    tracked.entry.ip_address.as_deref().map(str::trim) == Some(addr.as_str())
                        || tracked
                            .entry
                            .endpoint(port)
                            .is_some_and(|ep| ep.to_string() == *addr)
                }
            })
            .map(|(id, _)| *id)
            .collect();

        if matching.is_empty() {
            debug!(%selector, "nothing to disconnect");
        }
        for id in &matching {
            if let Some(tracked) = self.agents.remove(id) {
                info!(agent_id = id, "disconnecting agent");
                if let Some(link) = tracked.link {
                    link.shutdown().await;
                }
            }
        }
        matching
    }

    pub fn link(&self, id: AgentId) -> Result<&AgentLink, RegistryError> {
        let tracked = self.agents.get(&id).ok_or(RegistryError::UnknownAgent(id))?;
        tracked.link.as_ref().ok_or(RegistryError::NoLink(id))
    }

    pub fn agent(&self, id: AgentId) -> Option<&AgentEndpoint> {
        self.agents.get(&id).map(|t| &t.entry)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentEndpoint> + '_ {
        self.agents.values().map(|t| &t.entry)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Returns whether the command was queued on the agent's socket. Transport
    /// failures are logged, not returned, and never wait on the agent.
    pub fn send_control(&self, id: AgentId, linear_x: f64, angular_z: f64) -> Result<bool, RegistryError> {
        let link = self.link(id)?;
        match link.send_control(id, linear_x, angular_z) {
            Ok(sent) => Ok(sent),
            Err(e) => {
                debug!(agent_id = id, error = %e, "control command not delivered");
                Ok(false)
            }
        }
    }

    pub fn send_navigation(
        &self,
        id: AgentId,
        x: f64,
        y: f64,
        heading: Option<f64>,
    ) -> Result<bool, RegistryError> {
        let link = self.link(id)?;
        match link.send_navigation(id, x, y, heading) {
            Ok(sent) => Ok(sent),
            Err(e) => {
                warn!(agent_id = id, error = %e, "navigation command not delivered");
                Ok(false)
            }
        }
    }

    pub async fn close_all(&mut self) {
        let agents = std::mem::take(&mut self.agents);
        for (id, tracked) in agents {
            if let Some(link) = tracked.link {
                debug!(agent_id = id, "closing link");
                link.shutdown().await;
            }
        }
    }
}
