//! An in-process `GraphStore` backed by `DashMap`s, used for local/dev runs
//! and as the fixture every `registry`/`message-bus` unit test runs against.
//! Grounded on the teacher's `DashMap`-keyed `CanonicalState`.

use crate::{EdgeRecord, GraphStore, Properties, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;

type NodeKey = (String, String);

#[derive(Default)]
pub struct InMemoryStore {
    nodes: DashMap<NodeKey, Properties>,
    edges: DashMap<NodeKey, Vec<EdgeRecord>>,
    unique_constraints: DashMap<(String, String), ()>,
    indexes: DashMap<(String, String), ()>,
    relationship_types: DashMap<String, ()>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryStore {
    async fn add_node(
        &self,
        node_type: &str,
        id: &str,
        props: Properties,
    ) -> Result<(), StoreError> {
        let key = (node_type.to_owned(), id.to_owned());
        if self.nodes.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                node_type: node_type.to_owned(),
                id: id.to_owned(),
            });
        }
        self.nodes.insert(key, props);
        Ok(())
    }

    async fn update_node(
        &self,
        node_type: &str,
        id: &str,
        props: Properties,
    ) -> Result<(), StoreError> {
        let key = (node_type.to_owned(), id.to_owned());
        let mut entry = self.nodes.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            node_type: node_type.to_owned(),
            id: id.to_owned(),
        })?;
        entry.extend(props);
        Ok(())
    }

    async fn get_node(&self, node_type: &str, id: &str) -> Result<Properties, StoreError> {
        let key = (node_type.to_owned(), id.to_owned());
        self.nodes
            .get(&key)
            .map(|e| e.clone())
            .ok_or_else(|| StoreError::NotFound {
                node_type: node_type.to_owned(),
                id: id.to_owned(),
            })
    }

    async fn query_nodes(
        &self,
        node_type: &str,
        filters: &Properties,
    ) -> Result<Vec<Properties>, StoreError> {
        let matches = self
            .nodes
            .iter()
            .filter(|e| e.key().0 == node_type)
            .filter(|e| {
                filters
                    .iter()
                    .all(|(k, v)| e.value().get(k) == Some(v))
            })
            .map(|e| e.value().clone())
            .collect();
        Ok(matches)
    }

    async fn delete_node(&self, node_type: &str, id: &str) -> Result<(), StoreError> {
        let key = (node_type.to_owned(), id.to_owned());
        self.nodes.remove(&key);
        self.edges.remove(&key);
        Ok(())
    }

    /// `MERGE`s on `(label, target_type, target_id)`: an edge already
    /// matching those three is updated in place rather than duplicated, the
    /// same dedup a real graph engine's `MERGE` gives for free (a repeated
    /// `AddEdge`, e.g. from re-registering an agent, must not leave
    /// multiple `HAS_CAPABILITY` edges to the same capability node).
    async fn add_edge(
        &self,
        src_type: &str,
        src_id: &str,
        dst_type: &str,
        dst_id: &str,
        edge_label: &str,
        props: Properties,
    ) -> Result<(), StoreError> {
        self.relationship_types.insert(edge_label.to_owned(), ());
        let key = (src_type.to_owned(), src_id.to_owned());
        let mut edges = self.edges.entry(key).or_default();
        match edges
            .iter_mut()
            .find(|e| e.label == edge_label && e.target_type == dst_type && e.target_id == dst_id)
        {
            Some(existing) => existing.props = props,
            None => edges.push(EdgeRecord {
                label: edge_label.to_owned(),
                target_type: dst_type.to_owned(),
                target_id: dst_id.to_owned(),
                props,
            }),
        }
        Ok(())
    }

    async fn get_edges(
        &self,
        src_type: &str,
        src_id: &str,
    ) -> Result<Vec<EdgeRecord>, StoreError> {
        let key = (src_type.to_owned(), src_id.to_owned());
        Ok(self
            .edges
            .get(&key)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn create_unique_constraint(
        &self,
        node_type: &str,
        property: &str,
    ) -> Result<(), StoreError> {
        self.unique_constraints
            .insert((node_type.to_owned(), property.to_owned()), ());
        Ok(())
    }

    async fn create_index(&self, node_type: &str, property: &str) -> Result<(), StoreError> {
        self.indexes
            .insert((node_type.to_owned(), property.to_owned()), ());
        Ok(())
    }

    async fn drop_index(&self, node_type: &str, property: &str) -> Result<(), StoreError> {
        self.indexes
            .remove(&(node_type.to_owned(), property.to_owned()));
        Ok(())
    }

    async fn has_unique_constraint(
        &self,
        node_type: &str,
        property: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .unique_constraints
            .contains_key(&(node_type.to_owned(), property.to_owned())))
    }

    async fn has_index(&self, node_type: &str, property: &str) -> Result<bool, StoreError> {
        Ok(self
            .indexes
            .contains_key(&(node_type.to_owned(), property.to_owned())))
    }

    async fn has_relationship_type(&self, label: &str) -> Result<bool, StoreError> {
        Ok(self.relationship_types.contains_key(label))
    }
}

#[allow(dead_code)]
fn _distinct_node_types(store: &InMemoryStore) -> HashSet<String> {
    store.nodes.iter().map(|e| e.key().0.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), crate::PropertyValue::from(*v)))
            .collect()
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let store = InMemoryStore::new();
        store
            .add_node("agent", "a1", props(&[("name", "Alpha")]))
            .await
            .unwrap();
        let got = store.get_node("agent", "a1").await.unwrap();
        assert_eq!(got.get("name").unwrap().as_str(), Some("Alpha"));
    }

    #[tokio::test]
    async fn add_node_twice_fails_with_already_exists() {
        let store = InMemoryStore::new();
        store.add_node("agent", "a1", props(&[])).await.unwrap();
        let err = store.add_node("agent", "a1", props(&[])).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn update_node_merges_without_dropping_existing_keys() {
        let store = InMemoryStore::new();
        store
            .add_node("agent", "a1", props(&[("name", "Alpha")]))
            .await
            .unwrap();
        store
            .update_node("agent", "a1", props(&[("status", "Online")]))
            .await
            .unwrap();
        let got = store.get_node("agent", "a1").await.unwrap();
        assert_eq!(got.get("name").unwrap().as_str(), Some("Alpha"));
        assert_eq!(got.get("status").unwrap().as_str(), Some("Online"));
    }

    #[tokio::test]
    async fn update_missing_node_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .update_node("agent", "missing", props(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn edges_are_queryable_by_source() {
        let store = InMemoryStore::new();
        store.add_node("agent", "a1", props(&[])).await.unwrap();
        store
            .add_edge("agent", "a1", "capability", "word-count", "HAS_CAPABILITY", props(&[]))
            .await
            .unwrap();
        let edges = store.get_edges("agent", "a1").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_id, "word-count");
        assert!(store.has_relationship_type("HAS_CAPABILITY").await.unwrap());
    }

    #[tokio::test]
    async fn add_edge_merges_instead_of_duplicating() {
        let store = InMemoryStore::new();
        store.add_node("agent", "a1", props(&[])).await.unwrap();
        store
            .add_edge("agent", "a1", "capability", "word-count", "HAS_CAPABILITY", props(&[("v", "1")]))
            .await
            .unwrap();
        store
            .add_edge("agent", "a1", "capability", "word-count", "HAS_CAPABILITY", props(&[("v", "2")]))
            .await
            .unwrap();

        let edges = store.get_edges("agent", "a1").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].props.get("v").unwrap().as_str(), Some("2"));
    }
}
