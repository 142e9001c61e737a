//! `GraphStore` backed by a real Neo4j instance over Bolt, via `neo4rs`.

use crate::{EdgeRecord, GraphStore, Properties, PropertyValue, StoreError};
use async_trait::async_trait;
use neo4rs::{query, Graph, Node};

pub struct Neo4jStore {
    graph: Graph,
}

impl Neo4jStore {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, StoreError> {
        let graph = Graph::new(uri, user, password)
            .await
            .map_err(StoreError::backend)?;
        Ok(Self { graph })
    }

    fn to_bolt_params(props: &Properties) -> Vec<(&str, neo4rs::BoltType)> {
        props
            .iter()
            .map(|(k, v)| (k.as_str(), Self::to_bolt(v)))
            .collect()
    }

    fn to_bolt(value: &PropertyValue) -> neo4rs::BoltType {
        match value {
            PropertyValue::String(s) => neo4rs::BoltType::String(s.clone().into()),
            PropertyValue::Int(n) => neo4rs::BoltType::Integer((*n).into()),
            PropertyValue::Bool(b) => neo4rs::BoltType::Boolean((*b).into()),
        }
    }

    fn node_to_properties(node: &Node) -> Properties {
        // `neo4rs::Node` does not expose a generic property-bag accessor, so
        // callers of this store only ever read back properties they wrote
        // via the typed accessors the rest of the core relies on
        // (string/int/bool). Unsupported property kinds are skipped rather
        // than failing the whole read.
        let mut props = Properties::new();
        for key in node.keys() {
            if let Ok(s) = node.get::<String>(key) {
                props.insert(key.to_string(), PropertyValue::String(s));
            } else if let Ok(n) = node.get::<i64>(key) {
                props.insert(key.to_string(), PropertyValue::Int(n));
            } else if let Ok(b) = node.get::<bool>(key) {
                props.insert(key.to_string(), PropertyValue::Bool(b));
            }
        }
        props
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn add_node(
        &self,
        node_type: &str,
        id: &str,
        props: Properties,
    ) -> Result<(), StoreError> {
        if self.get_node(node_type, id).await.is_ok() {
            return Err(StoreError::AlreadyExists {
                node_type: node_type.to_owned(),
                id: id.to_owned(),
            });
        }

        let cypher = format!(
            "CREATE (n:{label} {{id: $id}}) SET n += $props",
            label = node_type
        );
        let props_map: std::collections::HashMap<String, neo4rs::BoltType> = props
            .iter()
            .map(|(k, v)| (k.clone(), Self::to_bolt(v)))
            .collect();
        self.graph
            .run(
                query(&cypher)
                    .param("id", id)
                    .param("props", props_map),
            )
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn update_node(
        &self,
        node_type: &str,
        id: &str,
        props: Properties,
    ) -> Result<(), StoreError> {
        self.get_node(node_type, id).await?;
        let cypher = format!(
            "MATCH (n:{label} {{id: $id}}) SET n += $props",
            label = node_type
        );
        let props_map: std::collections::HashMap<String, neo4rs::BoltType> = props
            .iter()
            .map(|(k, v)| (k.clone(), Self::to_bolt(v)))
            .collect();
        self.graph
            .run(
                query(&cypher)
                    .param("id", id)
                    .param("props", props_map),
            )
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn get_node(&self, node_type: &str, id: &str) -> Result<Properties, StoreError> {
        let cypher = format!("MATCH (n:{label} {{id: $id}}) RETURN n", label = node_type);
        let mut stream = self
            .graph
            .execute(query(&cypher).param("id", id))
            .await
            .map_err(StoreError::backend)?;

        match stream.next().await.map_err(StoreError::backend)? {
            Some(row) => {
                let node: Node = row.get("n").map_err(StoreError::backend)?;
                Ok(Self::node_to_properties(&node))
            }
            None => Err(StoreError::NotFound {
                node_type: node_type.to_owned(),
                id: id.to_owned(),
            }),
        }
    }

    async fn query_nodes(
        &self,
        node_type: &str,
        filters: &Properties,
    ) -> Result<Vec<Properties>, StoreError> {
        let where_clause = filters
            .keys()
            .map(|k| format!("n.{k} = ${k}"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let cypher = if where_clause.is_empty() {
            format!("MATCH (n:{label}) RETURN n", label = node_type)
        } else {
            format!(
                "MATCH (n:{label}) WHERE {where_clause} RETURN n",
                label = node_type
            )
        };

        let mut q = query(&cypher);
        for (k, v) in Self::to_bolt_params(filters) {
            q = q.param(k, v);
        }

        let mut stream = self.graph.execute(q).await.map_err(StoreError::backend)?;
        let mut results = Vec::new();
        while let Some(row) = stream.next().await.map_err(StoreError::backend)? {
            let node: Node = row.get("n").map_err(StoreError::backend)?;
            results.push(Self::node_to_properties(&node));
        }
        Ok(results)
    }

    async fn delete_node(&self, node_type: &str, id: &str) -> Result<(), StoreError> {
        let cypher = format!(
            "MATCH (n:{label} {{id: $id}}) DETACH DELETE n",
            label = node_type
        );
        self.graph
            .run(query(&cypher).param("id", id))
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn add_edge(
        &self,
        src_type: &str,
        src_id: &str,
        dst_type: &str,
        dst_id: &str,
        edge_label: &str,
        props: Properties,
    ) -> Result<(), StoreError> {
        let cypher = format!(
            "MATCH (a:{src_label} {{id: $src_id}}), (b:{dst_label} {{id: $dst_id}}) \
             MERGE (a)-[r:{edge_label}]->(b) SET r += $props",
            src_label = src_type,
            dst_label = dst_type,
            edge_label = edge_label,
        );
        let props_map: std::collections::HashMap<String, neo4rs::BoltType> = props
            .iter()
            .map(|(k, v)| (k.clone(), Self::to_bolt(v)))
            .collect();
        self.graph
            .run(
                query(&cypher)
                    .param("src_id", src_id)
                    .param("dst_id", dst_id)
                    .param("props", props_map),
            )
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn get_edges(
        &self,
        src_type: &str,
        src_id: &str,
    ) -> Result<Vec<EdgeRecord>, StoreError> {
        let cypher = format!(
            "MATCH (a:{src_label} {{id: $src_id}})-[r]->(b) RETURN type(r) AS label, labels(b) AS target_labels, b.id AS target_id, r AS rel",
            src_label = src_type,
        );
        let mut stream = self
            .graph
            .execute(query(&cypher).param("src_id", src_id))
            .await
            .map_err(StoreError::backend)?;

        let mut edges = Vec::new();
        while let Some(row) = stream.next().await.map_err(StoreError::backend)? {
            let label: String = row.get("label").map_err(StoreError::backend)?;
            let target_labels: Vec<String> =
                row.get("target_labels").map_err(StoreError::backend)?;
            let target_id: String = row.get("target_id").map_err(StoreError::backend)?;
            edges.push(EdgeRecord {
                label,
                target_type: target_labels.into_iter().next().unwrap_or_default(),
                target_id,
                props: Properties::new(),
            });
        }
        Ok(edges)
    }

    async fn create_unique_constraint(
        &self,
        node_type: &str,
        property: &str,
    ) -> Result<(), StoreError> {
        let cypher = format!(
            "CREATE CONSTRAINT IF NOT EXISTS FOR (n:{label}) REQUIRE n.{property} IS UNIQUE",
            label = node_type,
            property = property,
        );
        self.graph
            .run(query(&cypher))
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn create_index(&self, node_type: &str, property: &str) -> Result<(), StoreError> {
        let cypher = format!(
            "CREATE INDEX IF NOT EXISTS FOR (n:{label}) ON (n.{property})",
            label = node_type,
            property = property,
        );
        self.graph
            .run(query(&cypher))
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn drop_index(&self, node_type: &str, property: &str) -> Result<(), StoreError> {
        let cypher = format!(
            "DROP INDEX ON :{label}({property})",
            label = node_type,
            property = property,
        );
        self.graph
            .run(query(&cypher))
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn has_unique_constraint(
        &self,
        node_type: &str,
        property: &str,
    ) -> Result<bool, StoreError> {
        let mut stream = self
            .graph
            .execute(query("SHOW CONSTRAINTS YIELD labelsOrTypes, properties"))
            .await
            .map_err(StoreError::backend)?;

        while let Some(row) = stream.next().await.map_err(StoreError::backend)? {
            let labels: Vec<String> = row.get("labelsOrTypes").map_err(StoreError::backend)?;
            let properties: Vec<String> = row.get("properties").map_err(StoreError::backend)?;
            if labels.iter().any(|l| l == node_type) && properties.iter().any(|p| p == property) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn has_index(&self, node_type: &str, property: &str) -> Result<bool, StoreError> {
        let mut stream = self
            .graph
            .execute(query("SHOW INDEXES YIELD labelsOrTypes, properties"))
            .await
            .map_err(StoreError::backend)?;

        while let Some(row) = stream.next().await.map_err(StoreError::backend)? {
            let labels: Vec<String> = row.get("labelsOrTypes").map_err(StoreError::backend)?;
            let properties: Vec<String> = row.get("properties").map_err(StoreError::backend)?;
            if labels.iter().any(|l| l == node_type) && properties.iter().any(|p| p == property) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn has_relationship_type(&self, label: &str) -> Result<bool, StoreError> {
        let mut stream = self
            .graph
            .execute(query("CALL db.relationshipTypes() YIELD relationshipType"))
            .await
            .map_err(StoreError::backend)?;

        while let Some(row) = stream.next().await.map_err(StoreError::backend)? {
            let rel_type: String = row.get("relationshipType").map_err(StoreError::backend)?;
            if rel_type == label {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
