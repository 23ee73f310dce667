//! Flow graph stored in a shared document.
//!
//! Two root maps hold the graph, each entry a JSON object keyed by id:
//!
//! ```text
//! "nodes": { node_id → {"id", ...fields} }
//! "edges": { edge_id → {"id", "source", "target", ...fields} }
//! ```
//!
//! Every operation is a single local transaction, so each one reaches the
//! network as exactly one delta.

use std::collections::HashSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;
use yrs::{Any, Map, MapRef, Out};

use crate::document::YDocument;

/// Root map holding nodes.
pub const NODES: &str = "nodes";
/// Root map holding edges.
pub const EDGES: &str = "edges";

/// A graph node. Fields other than `id` are opaque to the sync layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub fields: JsonMap<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: JsonMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub fields: JsonMap<String, Value>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            fields: JsonMap::new(),
        }
    }

    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn decode<T: DeserializeOwned>(value: &Out) -> Option<T> {
    match value {
        Out::Any(Any::String(json)) => serde_json::from_str(json).ok(),
        _ => None,
    }
}

/// Node/edge editing on top of a [`YDocument`].
pub struct FlowGraph {
    document: Arc<YDocument>,
    nodes: MapRef,
    edges: MapRef,
}

impl FlowGraph {
    pub fn new(document: Arc<YDocument>) -> Self {
        let nodes = document.map(NODES);
        let edges = document.map(EDGES);
        Self {
            document,
            nodes,
            edges,
        }
    }

    pub fn document(&self) -> &Arc<YDocument> {
        &self.document
    }

    /// Insert or overwrite a node.
    pub fn add_node(&self, node: &Node) -> Result<(), GraphError> {
        let json = serde_json::to_string(node)?;
        self.document.transact(|txn| {
            self.nodes.insert(txn, node.id.as_str(), json);
        });
        Ok(())
    }

    /// Shallow-merge `patch` into an existing node. Returns false if absent.
    pub fn update_node(&self, id: &str, patch: JsonMap<String, Value>) -> Result<bool, GraphError> {
        let Some(mut node) = self.node(id) else {
            return Ok(false);
        };
        for (key, value) in patch {
            if key != "id" {
                node.fields.insert(key, value);
            }
        }
        self.add_node(&node)?;
        Ok(true)
    }

    /// Remove a node together with every edge that touches it.
    pub fn delete_node(&self, id: &str) -> bool {
        self.document.transact(|txn| {
            let existed = self.nodes.remove(txn, id).is_some();
            let incident: Vec<String> = self
                .edges
                .iter(&*txn)
                .filter_map(|(key, value)| {
                    let edge: Edge = decode(&value)?;
                    edge.touches(id).then(|| key.to_string())
                })
                .collect();
            for key in &incident {
                self.edges.remove(txn, key);
            }
            existed
        })
    }

    /// Replace the whole node set.
    pub fn set_nodes(&self, nodes: &[Node]) -> Result<(), GraphError> {
        let encoded = encode_all(nodes.iter().map(|n| (n.id.as_str(), n)))?;
        self.replace_all(&self.nodes, encoded);
        Ok(())
    }

    pub fn add_edge(&self, edge: &Edge) -> Result<(), GraphError> {
        let json = serde_json::to_string(edge)?;
        self.document.transact(|txn| {
            self.edges.insert(txn, edge.id.as_str(), json);
        });
        Ok(())
    }

    pub fn delete_edge(&self, id: &str) -> bool {
        self.document
            .transact(|txn| self.edges.remove(txn, id).is_some())
    }

    /// Replace the whole edge set.
    pub fn set_edges(&self, edges: &[Edge]) -> Result<(), GraphError> {
        let encoded = encode_all(edges.iter().map(|e| (e.id.as_str(), e)))?;
        self.replace_all(&self.edges, encoded);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.document
            .read(|txn| self.nodes.get(txn, id).and_then(|v| decode(&v)))
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .document
            .read(|txn| self.nodes.iter(txn).filter_map(|(_, v)| decode(&v)).collect());
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// All edges, ordered by id.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .document
            .read(|txn| self.edges.iter(txn).filter_map(|(_, v)| decode(&v)).collect());
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    pub fn node_count(&self) -> usize {
        self.document.read(|txn| self.nodes.len(txn) as usize)
    }

    pub fn edge_count(&self) -> usize {
        self.document.read(|txn| self.edges.len(txn) as usize)
    }

    fn replace_all(&self, map: &MapRef, entries: Vec<(String, String)>) {
        let keep: HashSet<&str> = entries.iter().map(|(id, _)| id.as_str()).collect();
        self.document.transact(|txn| {
            let stale: Vec<String> = map
                .keys(&*txn)
                .filter(|key| !keep.contains(key))
                .map(str::to_string)
                .collect();
            for key in &stale {
                map.remove(txn, key);
            }
            for (id, json) in entries.iter() {
                map.insert(txn, id.as_str(), json.clone());
            }
        });
    }
}

fn encode_all<'a, T: Serialize + 'a>(
    items: impl Iterator<Item = (&'a str, &'a T)>,
) -> Result<Vec<(String, String)>, GraphError> {
    items
        .map(|(id, item)| Ok((id.to_string(), serde_json::to_string(item)?)))
        .collect()
}
