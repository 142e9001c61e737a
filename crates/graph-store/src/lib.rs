//! `GraphStore` is the one contract the orchestration hub needs from the
//! external graph engine: node/edge CRUD, constraints, and typed queries.
//! Everything else about the engine is implementation detail hidden behind
//! this trait (spec §4.1).
//!
//! Two backends satisfy it: [`neo4j::Neo4jStore`] talks Bolt to a real Neo4j
//! instance; [`memory::InMemoryStore`] is a `dashmap`-backed fixture used by
//! tests and local/dev runs. Callers only ever hold a `dyn GraphStore`.

pub mod memory;
pub mod neo4j;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// A flat property bag. Graph engines that only support scalar flat
/// properties (the common case) can store these directly; richer engines
/// may use whatever internal representation they like as long as round-trips
/// preserve these values.
pub type Properties = HashMap<String, PropertyValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Int(n)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// One outgoing relationship from a node, as returned by `GetEdges`.
#[derive(Debug, Clone)]
pub struct EdgeRecord {
    pub label: String,
    pub target_type: String,
    pub target_id: String,
    pub props: Properties,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node ({node_type}, {id}) already exists")]
    AlreadyExists { node_type: String, id: String },
    #[error("node ({node_type}, {id}) not found")]
    NotFound { node_type: String, id: String },
    #[error("graph store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// The node/edge operations the orchestration hub's core relies on.
/// Every call is atomic in isolation; no multi-call transactions are
/// assumed (spec §4.1).
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn add_node(
        &self,
        node_type: &str,
        id: &str,
        props: Properties,
    ) -> Result<(), StoreError>;

    async fn update_node(
        &self,
        node_type: &str,
        id: &str,
        props: Properties,
    ) -> Result<(), StoreError>;

    async fn get_node(&self, node_type: &str, id: &str) -> Result<Properties, StoreError>;

    async fn query_nodes(
        &self,
        node_type: &str,
        filters: &Properties,
    ) -> Result<Vec<Properties>, StoreError>;

    async fn delete_node(&self, node_type: &str, id: &str) -> Result<(), StoreError>;

    #[allow(clippy::too_many_arguments)]
    async fn add_edge(
        &self,
        src_type: &str,
        src_id: &str,
        dst_type: &str,
        dst_id: &str,
        edge_label: &str,
        props: Properties,
    ) -> Result<(), StoreError>;

    async fn get_edges(
        &self,
        src_type: &str,
        src_id: &str,
    ) -> Result<Vec<EdgeRecord>, StoreError>;

    async fn create_unique_constraint(
        &self,
        node_type: &str,
        property: &str,
    ) -> Result<(), StoreError>;

    async fn create_index(&self, node_type: &str, property: &str) -> Result<(), StoreError>;

    async fn drop_index(&self, node_type: &str, property: &str) -> Result<(), StoreError>;

    async fn has_unique_constraint(
        &self,
        node_type: &str,
        property: &str,
    ) -> Result<bool, StoreError>;

    async fn has_index(&self, node_type: &str, property: &str) -> Result<bool, StoreError>;

    async fn has_relationship_type(&self, label: &str) -> Result<bool, StoreError>;
}
