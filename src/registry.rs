//! Agent registry: which names are valid agents and whether they run.
//!
//! The router only reads the registry and asks it to start or stop agents;
//! the lifecycle service behind it owns the actual processes.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::RegistryError,
    types::{AgentName, AgentStatus},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: AgentName,
    pub status: AgentStatus,
    /// Created but never started; its first start is followed by a forced
    /// re-initialization cycle.
    #[serde(default)]
    pub never_started: bool,
}

/// Point-in-time view of the registry. Every routing decision is computed
/// from exactly one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    available: BTreeSet<AgentName>,
    agents: BTreeMap<AgentName, AgentRecord>,
}

impl RegistrySnapshot {
    pub fn new(
        available: impl IntoIterator<Item = AgentName>,
        records: impl IntoIterator<Item = AgentRecord>,
    ) -> Self {
        Self {
            available: available.into_iter().collect(),
            agents: records
                .into_iter()
                .map(|record| (record.name.clone(), record))
                .collect(),
        }
    }

    /// Snapshot where every record is also an available name.
    pub fn from_records(records: impl IntoIterator<Item = AgentRecord>) -> Self {
        let agents: BTreeMap<AgentName, AgentRecord> = records
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect();
        Self {
            available: agents.keys().cloned().collect(),
            agents,
        }
    }

    pub fn contains(&self, name: &AgentName) -> bool {
        self.available.contains(name)
    }

    /// Unregistered agents report `Stopped`.
    pub fn status(&self, name: &AgentName) -> AgentStatus {
        self.agents
            .get(name)
            .map(|record| record.status)
            .unwrap_or(AgentStatus::Stopped)
    }

    pub fn record(&self, name: &AgentName) -> Option<&AgentRecord> {
        self.agents.get(name)
    }

    pub fn names(&self) -> Vec<AgentName> {
        self.available.iter().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn list_available_names(&self) -> Result<BTreeSet<AgentName>, RegistryError>;

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, RegistryError>;

    async fn status(&self, name: &AgentName) -> Result<AgentStatus, RegistryError>;

    async fn request_start(&self, name: &AgentName) -> Result<(), RegistryError>;

    async fn request_stop(&self, name: &AgentName) -> Result<(), RegistryError>;

    async fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError> {
        let available = self.list_available_names().await?;
        let records = self.list_agents().await?;
        Ok(RegistrySnapshot::new(available, records))
    }
}

// ---------------------------------------------------------------------------
// In-process registry
// ---------------------------------------------------------------------------

/// In-memory registry used when no lifecycle service is configured, and by
/// tests. Starts and stops flip the status locally, optionally after a delay
/// that stands in for process boot time.
#[derive(Clone, Default)]
pub struct LocalRegistry {
    agents: Arc<RwLock<BTreeMap<AgentName, AgentRecord>>>,
    start_latency: Option<Duration>,
    refuse_start: Arc<RwLock<BTreeSet<AgentName>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_running<I, N>(names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<AgentName>,
    {
        let registry = Self::new();
        for name in names {
            registry.insert(name.into(), AgentStatus::Running, false);
        }
        registry
    }

    /// Agents started through this registry become running only after
    /// `latency` has elapsed.
    pub fn with_start_latency(mut self, latency: Duration) -> Self {
        self.start_latency = Some(latency);
        self
    }

    pub fn insert(&self, name: AgentName, status: AgentStatus, never_started: bool) {
        self.agents.write().insert(
            name.clone(),
            AgentRecord {
                name,
                status,
                never_started,
            },
        );
    }

    /// Registers a freshly created agent that has never been started.
    pub fn create(&self, name: impl Into<AgentName>) {
        self.insert(name.into(), AgentStatus::Stopped, true);
    }

    pub fn set_status(&self, name: &AgentName, status: AgentStatus) {
        if let Some(record) = self.agents.write().get_mut(name) {
            record.status = status;
        }
    }

    /// Makes every later start request for `name` fail.
    pub fn refuse_starts_for(&self, name: impl Into<AgentName>) {
        self.refuse_start.write().insert(name.into());
    }

    pub fn remove(&self, name: &AgentName) {
        self.agents.write().remove(name);
    }
}

#[async_trait]
impl AgentRegistry for LocalRegistry {
    async fn list_available_names(&self) -> Result<BTreeSet<AgentName>, RegistryError> {
        Ok(self.agents.read().keys().cloned().collect())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        Ok(self.agents.read().values().cloned().collect())
    }

    async fn status(&self, name: &AgentName) -> Result<AgentStatus, RegistryError> {
        self.agents
            .read()
            .get(name)
            .map(|record| record.status)
            .ok_or_else(|| RegistryError::UnknownAgent(name.clone()))
    }

    async fn request_start(&self, name: &AgentName) -> Result<(), RegistryError> {
        if self.refuse_start.read().contains(name) {
            return Err(RegistryError::Lifecycle(format!(
                "agent '{name}' failed to launch"
            )));
        }

        {
            let mut agents = self.agents.write();
            let record = agents
                .get_mut(name)
                .ok_or_else(|| RegistryError::UnknownAgent(name.clone()))?;
            record.never_started = false;
            if self.start_latency.is_none() {
                record.status = AgentStatus::Running;
            }
        }

        if let Some(latency) = self.start_latency {
            let registry = self.clone();
            let name = name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                registry.set_status(&name, AgentStatus::Running);
            });
        }

        tracing::debug!(target = "router::registry", agent = %name, "local start");
        Ok(())
    }

    async fn request_stop(&self, name: &AgentName) -> Result<(), RegistryError> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownAgent(name.clone()))?;
        record.status = AgentStatus::Stopped;
        tracing::debug!(target = "router::registry", agent = %name, "local stop");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lifecycle service client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AgentInfoWire {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    never_started: bool,
}

impl From<AgentInfoWire> for AgentRecord {
    fn from(wire: AgentInfoWire) -> Self {
        AgentRecord {
            name: AgentName::new(wire.name),
            status: AgentStatus::parse(&wire.status),
            never_started: wire.never_started,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LifecycleReply {
    ok: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct NameBody<'a> {
    name: &'a str,
}

/// Registry backed by the external lifecycle service's REST API.
#[derive(Clone)]
pub struct HttpAgentRegistry {
    http: reqwest::Client,
    base_url: String,
}

/// Upper bound on any single lifecycle service request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl HttpAgentRegistry {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RegistryError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, RegistryError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn lifecycle(&self, action: &str, name: &AgentName) -> Result<(), RegistryError> {
        let response = self
            .http
            .post(format!("{}/agents/{}", self.base_url, action))
            .json(&NameBody {
                name: name.as_str(),
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: LifecycleReply = response.json().await?;
        if !reply.ok {
            return Err(RegistryError::Lifecycle(
                reply
                    .error
                    .unwrap_or_else(|| format!("{action} of '{name}' was rejected")),
            ));
        }
        tracing::debug!(
            target = "router::registry",
            agent = %name,
            action = action,
            message = reply.message.as_deref().unwrap_or(""),
            "lifecycle request accepted"
        );
        Ok(())
    }
}

#[async_trait]
impl AgentRegistry for HttpAgentRegistry {
    async fn list_available_names(&self) -> Result<BTreeSet<AgentName>, RegistryError> {
        let names: Vec<String> = self.get_json("/agents/available").await?;
        Ok(names.into_iter().map(AgentName::new).collect())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        let agents: Vec<AgentInfoWire> = self.get_json("/agents").await?;
        Ok(agents.into_iter().map(AgentRecord::from).collect())
    }

    async fn status(&self, name: &AgentName) -> Result<AgentStatus, RegistryError> {
        let agents = self.list_agents().await?;
        Ok(agents
            .into_iter()
            .find(|record| &record.name == name)
            .map(|record| record.status)
            .unwrap_or(AgentStatus::Stopped))
    }

    async fn request_start(&self, name: &AgentName) -> Result<(), RegistryError> {
        self.lifecycle("start", name).await
    }

    async fn request_stop(&self, name: &AgentName) -> Result<(), RegistryError> {
        self.lifecycle("stop", name).await
    }
}
