//! The Agent Registry (spec §4.2): a stateless façade over [`GraphStore`]
//! that owns agent identity, capability advertisement, and heartbeat-based
//! liveness. No in-memory cache is authoritative — every read and write
//! goes through the store.

mod error;
pub mod model;

pub use error::RegistryError;
pub use model::{Agent, AgentStatus, Capability};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use graph_store::{EdgeRecord, GraphStore, Properties, PropertyValue, StoreError};
use std::sync::Arc;

pub const AGENT_NODE_TYPE: &str = "agent";
pub const CAPABILITY_NODE_TYPE: &str = "capability";
pub const HAS_CAPABILITY_EDGE: &str = "HAS_CAPABILITY";

/// 30s plus a 1s grace period: an agent is healthy at exactly 30s since
/// `last_seen` and unhealthy at 31s (spec §4.2).
pub const HEARTBEAT_DEADLINE: ChronoDuration = ChronoDuration::seconds(31);

pub struct AgentRegistry {
    store: Arc<dyn GraphStore>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Idempotently creates the schema the registry relies on. Safe to call
    /// on every process start (spec §7 crash semantics).
    pub async fn bootstrap_schema(&self) -> Result<(), RegistryError> {
        self.store
            .create_unique_constraint(AGENT_NODE_TYPE, "id")
            .await?;
        self.store.create_index(AGENT_NODE_TYPE, "status").await?;
        Ok(())
    }

    /// Registers or re-registers an agent. If a record already exists for
    /// `agent.id`, this performs an update preserving `created_at` and
    /// setting status back to `Online`; otherwise it creates a fresh node.
    /// Either way the result is a single node with the agent `Online`
    /// (spec §4.2 idempotent re-registration policy).
    pub async fn register_agent(&self, mut agent: Agent) -> Result<Agent, RegistryError> {
        agent.validate()?;
        let now = Utc::now();

        let previous = match self.store.get_node(AGENT_NODE_TYPE, &agent.id).await {
            Ok(props) => Some(props),
            Err(StoreError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        agent.created_at = match &previous {
            Some(props) => parse_timestamp(props, "created_at").unwrap_or(now),
            None => now,
        };
        agent.status = AgentStatus::Online;
        agent.updated_at = now;
        agent.last_seen = now;

        let props = agent_to_properties(&agent)?;
        if previous.is_some() {
            self.store.update_node(AGENT_NODE_TYPE, &agent.id, props).await?;
        } else {
            self.store.add_node(AGENT_NODE_TYPE, &agent.id, props).await?;
        }

        for capability in &agent.capabilities {
            self.write_capability(&agent.id, capability).await?;
        }

        tracing::info!(agent_id = %agent.id, reregistered = previous.is_some(), "agent registered");
        Ok(agent)
    }

    async fn write_capability(
        &self,
        agent_id: &str,
        capability: &Capability,
    ) -> Result<(), RegistryError> {
        let node_id = capability_node_id(agent_id, &capability.name);
        let props = capability_properties(capability);
        match self.store.add_node(CAPABILITY_NODE_TYPE, &node_id, props).await {
            Ok(()) | Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.store
            .add_edge(
                AGENT_NODE_TYPE,
                agent_id,
                CAPABILITY_NODE_TYPE,
                &node_id,
                HAS_CAPABILITY_EDGE,
                Properties::new(),
            )
            .await?;
        Ok(())
    }

    /// Unregistration is a status transition, never a physical delete
    /// (spec §3 Agent lifecycle).
    pub async fn unregister_agent(&self, id: &str) -> Result<(), RegistryError> {
        self.transition_status(id, AgentStatus::Offline).await
    }

    pub async fn get_agent(&self, id: &str) -> Result<Agent, RegistryError> {
        let props = self
            .store
            .get_node(AGENT_NODE_TYPE, id)
            .await
            .map_err(|e| map_not_found(e, id))?;
        let capabilities = self.read_capabilities(id).await?;
        agent_from_properties(id, &props, capabilities)
    }

    pub async fn get_all_agents(&self) -> Result<Vec<Agent>, RegistryError> {
        let rows = self
            .store
            .query_nodes(AGENT_NODE_TYPE, &Properties::new())
            .await?;
        self.hydrate(rows).await
    }

    pub async fn get_agents_by_status(
        &self,
        status: AgentStatus,
    ) -> Result<Vec<Agent>, RegistryError> {
        let mut filters = Properties::new();
        filters.insert("status".into(), PropertyValue::from(status.as_str()));
        let rows = self.store.query_nodes(AGENT_NODE_TYPE, &filters).await?;
        self.hydrate(rows).await
    }

    /// Filters client-side, as spec §4.2 mandates — capability membership
    /// is not a flat property the store can filter on directly.
    pub async fn get_agents_by_capability(
        &self,
        capability_name: &str,
    ) -> Result<Vec<Agent>, RegistryError> {
        if capability_name.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "capability name must not be empty".into(),
            ));
        }
        let all = self.get_all_agents().await?;
        Ok(all
            .into_iter()
            .filter(|a| a.capabilities.iter().any(|c| c.name == capability_name))
            .collect())
    }

    pub async fn update_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
    ) -> Result<(), RegistryError> {
        self.transition_status(id, status).await
    }

    async fn transition_status(&self, id: &str, status: AgentStatus) -> Result<(), RegistryError> {
        self.store
            .get_node(AGENT_NODE_TYPE, id)
            .await
            .map_err(|e| map_not_found(e, id))?;

        let mut props = Properties::new();
        props.insert("status".into(), PropertyValue::from(status.as_str()));
        props.insert(
            "updated_at".into(),
            PropertyValue::from(Utc::now().to_rfc3339()),
        );
        self.store
            .update_node(AGENT_NODE_TYPE, id, props)
            .await
            .map_err(|e| map_not_found(e, id))
    }

    pub async fn update_agent_last_seen(&self, id: &str) -> Result<(), RegistryError> {
        self.store
            .get_node(AGENT_NODE_TYPE, id)
            .await
            .map_err(|e| map_not_found(e, id))?;

        let mut props = Properties::new();
        props.insert(
            "last_seen".into(),
            PropertyValue::from(Utc::now().to_rfc3339()),
        );
        self.store
            .update_node(AGENT_NODE_TYPE, id, props)
            .await
            .map_err(|e| map_not_found(e, id))
    }

    pub async fn is_agent_healthy(&self, id: &str) -> Result<bool, RegistryError> {
        let agent = self.get_agent(id).await?;
        Ok(is_healthy(&agent, Utc::now()))
    }

    /// Scans all Online agents and demotes any whose `last_seen` is past
    /// the heartbeat deadline to Disconnected. Per-agent failures are
    /// logged and do not abort the scan (spec §4.2). Returns the number of
    /// agents demoted.
    pub async fn monitor_agent_health(&self) -> Result<u64, RegistryError> {
        let online = self.get_agents_by_status(AgentStatus::Online).await?;
        let now = Utc::now();
        let mut demoted = 0;
        for agent in online {
            if is_healthy(&agent, now) {
                continue;
            }
            if let Err(e) = self
                .update_agent_status(&agent.id, AgentStatus::Disconnected)
                .await
            {
                tracing::warn!(agent_id = %agent.id, error = %e, "failed to demote stale agent");
            } else {
                tracing::info!(agent_id = %agent.id, "agent demoted to Disconnected after missed heartbeats");
                demoted += 1;
            }
        }
        Ok(demoted)
    }

    async fn read_capabilities(&self, agent_id: &str) -> Result<Vec<Capability>, RegistryError> {
        let edges = self.store.get_edges(AGENT_NODE_TYPE, agent_id).await?;
        let mut capabilities = Vec::new();
        for edge in edges
            .into_iter()
            .filter(|e: &EdgeRecord| e.label == HAS_CAPABILITY_EDGE)
        {
            match self
                .store
                .get_node(CAPABILITY_NODE_TYPE, &edge.target_id)
                .await
            {
                Ok(props) => capabilities.extend(capability_from_properties(&props)),
                Err(StoreError::NotFound { .. }) => {
                    tracing::warn!(agent_id = %agent_id, capability_node = %edge.target_id, "capability edge points at a missing node");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(capabilities)
    }

    async fn hydrate(&self, rows: Vec<Properties>) -> Result<Vec<Agent>, RegistryError> {
        let mut agents = Vec::with_capacity(rows.len());
        for props in rows {
            let id = props
                .get("id")
                .and_then(PropertyValue::as_str)
                .unwrap_or_default()
                .to_owned();
            let capabilities = self.read_capabilities(&id).await?;
            agents.push(agent_from_properties(&id, &props, capabilities)?);
        }
        Ok(agents)
    }
}

pub fn is_healthy(agent: &Agent, now: DateTime<Utc>) -> bool {
    agent.status == AgentStatus::Online && now - agent.last_seen < HEARTBEAT_DEADLINE
}

fn capability_node_id(agent_id: &str, capability_name: &str) -> String {
    format!("{agent_id}::{capability_name}")
}

/// Decodes a `Capability` back out of a capability node's stored
/// properties (the inverse of [`capability_properties`]), so `GetAgent`
/// round-trips the description and parameters a caller registered rather
/// than just the name encoded in the node id (spec §8).
fn capability_from_properties(props: &Properties) -> Option<Capability> {
    let name = props.get("name").and_then(PropertyValue::as_str)?.to_owned();
    let description = props
        .get("description")
        .and_then(PropertyValue::as_str)
        .unwrap_or_default()
        .to_owned();
    let parameters = props
        .get("parameters")
        .and_then(PropertyValue::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    Some(Capability {
        name,
        description,
        parameters,
    })
}

fn capability_properties(capability: &Capability) -> Properties {
    let mut props = Properties::new();
    props.insert("name".into(), PropertyValue::from(capability.name.clone()));
    props.insert(
        "description".into(),
        PropertyValue::from(capability.description.clone()),
    );
    props.insert(
        "parameters".into(),
        PropertyValue::from(
            serde_json::to_string(&capability.parameters).unwrap_or_default(),
        ),
    );
    props
}

fn agent_to_properties(agent: &Agent) -> Result<Properties, RegistryError> {
    let mut props = Properties::new();
    props.insert("id".into(), PropertyValue::from(agent.id.clone()));
    props.insert("name".into(), PropertyValue::from(agent.name.clone()));
    props.insert(
        "description".into(),
        PropertyValue::from(agent.description.clone()),
    );
    props.insert(
        "status".into(),
        PropertyValue::from(agent.status.as_str()),
    );
    let capability_names: Vec<&str> = agent.capabilities.iter().map(|c| c.name.as_str()).collect();
    props.insert(
        "capabilities".into(),
        PropertyValue::from(
            serde_json::to_string(&capability_names)
                .map_err(|e| RegistryError::InvalidArgument(e.to_string()))?,
        ),
    );
    props.insert(
        "metadata".into(),
        PropertyValue::from(
            serde_json::to_string(&agent.metadata)
                .map_err(|e| RegistryError::InvalidArgument(e.to_string()))?,
        ),
    );
    props.insert(
        "created_at".into(),
        PropertyValue::from(agent.created_at.to_rfc3339()),
    );
    props.insert(
        "updated_at".into(),
        PropertyValue::from(agent.updated_at.to_rfc3339()),
    );
    props.insert(
        "last_seen".into(),
        PropertyValue::from(agent.last_seen.to_rfc3339()),
    );
    Ok(props)
}

fn agent_from_properties(
    id: &str,
    props: &Properties,
    capabilities: Vec<Capability>,
) -> Result<Agent, RegistryError> {
    let status = props
        .get("status")
        .and_then(PropertyValue::as_str)
        .and_then(AgentStatus::parse)
        .ok_or_else(|| RegistryError::InvalidArgument(format!("agent '{id}' has no valid status")))?;

    let metadata = props
        .get("metadata")
        .and_then(PropertyValue::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    Ok(Agent {
        id: id.to_owned(),
        name: string_prop(props, "name"),
        description: string_prop(props, "description"),
        status,
        capabilities,
        metadata,
        created_at: parse_timestamp(props, "created_at")
            .ok_or_else(|| RegistryError::InvalidArgument(format!("agent '{id}' has no created_at")))?,
        updated_at: parse_timestamp(props, "updated_at")
            .ok_or_else(|| RegistryError::InvalidArgument(format!("agent '{id}' has no updated_at")))?,
        last_seen: parse_timestamp(props, "last_seen")
            .ok_or_else(|| RegistryError::InvalidArgument(format!("agent '{id}' has no last_seen")))?,
    })
}

fn string_prop(props: &Properties, key: &str) -> String {
    props
        .get(key)
        .and_then(PropertyValue::as_str)
        .unwrap_or_default()
        .to_owned()
}

fn parse_timestamp(props: &Properties, key: &str) -> Option<DateTime<Utc>> {
    props
        .get(key)
        .and_then(PropertyValue::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn map_not_found(err: StoreError, id: &str) -> RegistryError {
    match err {
        StoreError::NotFound { .. } => RegistryError::NotFound(id.to_owned()),
        other => RegistryError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_store::memory::InMemoryStore;
    use std::collections::HashMap as Map;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(InMemoryStore::new()))
    }

    fn sample_agent(id: &str) -> Agent {
        let mut parameters = Map::new();
        parameters.insert("max_len".into(), "4096".into());
        Agent::new(
            id,
            "Text Processor",
            "counts words",
            vec![Capability {
                name: "word-count".into(),
                description: "counts words in text".into(),
                parameters,
            }],
            Map::new(),
        )
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let reg = registry();
        reg.register_agent(sample_agent("a1")).await.unwrap();
        let agent = reg.get_agent("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.capabilities.len(), 1);
        assert_eq!(agent.capabilities[0].name, "word-count");
        assert_eq!(agent.capabilities[0].description, "counts words in text");
        assert_eq!(
            agent.capabilities[0].parameters.get("max_len").map(String::as_str),
            Some("4096")
        );
    }

    #[tokio::test]
    async fn empty_capabilities_is_rejected() {
        let reg = registry();
        let agent = Agent::new("a1", "Name", "desc", vec![], Map::new());
        let err = reg.register_agent(agent).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn reregistration_is_idempotent_and_preserves_created_at() {
        let reg = registry();
        let first = reg.register_agent(sample_agent("a1")).await.unwrap();
        reg.unregister_agent("a1").await.unwrap();
        let second = reg.register_agent(sample_agent("a1")).await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.status, AgentStatus::Online);
        assert_eq!(reg.get_all_agents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reregistration_does_not_duplicate_capability_edges() {
        let reg = registry();
        reg.register_agent(sample_agent("a1")).await.unwrap();
        reg.register_agent(sample_agent("a1")).await.unwrap();
        reg.register_agent(sample_agent("a1")).await.unwrap();

        let agent = reg.get_agent("a1").await.unwrap();
        assert_eq!(agent.capabilities.len(), 1);
    }

    #[tokio::test]
    async fn unregister_sets_offline_never_deletes() {
        let reg = registry();
        reg.register_agent(sample_agent("a1")).await.unwrap();
        reg.unregister_agent("a1").await.unwrap();
        let agent = reg.get_agent("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn health_threshold_is_31_seconds() {
        let mut agent = sample_agent("a1");
        let now = Utc::now();
        agent.status = AgentStatus::Online;

        agent.last_seen = now - ChronoDuration::seconds(30);
        assert!(is_healthy(&agent, now));

        agent.last_seen = now - ChronoDuration::seconds(31);
        assert!(!is_healthy(&agent, now));
    }

    #[tokio::test]
    async fn monitor_health_demotes_stale_online_agents() {
        let reg = registry();
        reg.register_agent(sample_agent("a1")).await.unwrap();

        // Simulate a stale heartbeat by writing last_seen directly through
        // the same update path Heartbeat would use, but backdated.
        let mut props = Properties::new();
        props.insert(
            "last_seen".into(),
            PropertyValue::from((Utc::now() - ChronoDuration::seconds(60)).to_rfc3339()),
        );
        reg.store.update_node(AGENT_NODE_TYPE, "a1", props).await.unwrap();

        reg.monitor_agent_health().await.unwrap();
        let agent = reg.get_agent("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Disconnected);
    }
}
