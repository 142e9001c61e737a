//! The `Agent` and `Capability` data model (spec §3), independent of both
//! the wire types generated from `.proto` and the flat property bags
//! `graph-store` persists them as.

use crate::RegistryError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
    Maintenance,
    Disconnected,
    Error,
    ShuttingDown,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "Online",
            AgentStatus::Offline => "Offline",
            AgentStatus::Busy => "Busy",
            AgentStatus::Maintenance => "Maintenance",
            AgentStatus::Disconnected => "Disconnected",
            AgentStatus::Error => "Error",
            AgentStatus::ShuttingDown => "ShuttingDown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Online" => Some(AgentStatus::Online),
            "Offline" => Some(AgentStatus::Offline),
            "Busy" => Some(AgentStatus::Busy),
            "Maintenance" => Some(AgentStatus::Maintenance),
            "Disconnected" => Some(AgentStatus::Disconnected),
            "Error" => Some(AgentStatus::Error),
            "ShuttingDown" => Some(AgentStatus::ShuttingDown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub parameters: HashMap<String, String>,
}

impl Capability {
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "capability name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: AgentStatus,
    pub capabilities: Vec<Capability>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Agent {
    /// A fresh, not-yet-persisted agent record as supplied by
    /// `RegisterAgent`. Timestamps and status are assigned by the registry,
    /// not the caller.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        capabilities: Vec<Capability>,
        metadata: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            status: AgentStatus::Online,
            capabilities,
            metadata,
            created_at: now,
            updated_at: now,
            last_seen: now,
        }
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.id.is_empty() || !self.id.chars().all(is_id_char) {
            return Err(RegistryError::InvalidArgument(format!(
                "agent id '{}' must be non-empty and match [A-Za-z0-9_-]+",
                self.id
            )));
        }
        if self.name.is_empty() || self.name.chars().count() > 100 {
            return Err(RegistryError::InvalidArgument(
                "agent name must be 1..100 chars".into(),
            ));
        }
        if self.description.chars().count() > 500 {
            return Err(RegistryError::InvalidArgument(
                "agent description must be at most 500 chars".into(),
            ));
        }
        if self.capabilities.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "agent must declare at least one capability".into(),
            ));
        }
        for capability in &self.capabilities {
            capability.validate()?;
        }
        Ok(())
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}
