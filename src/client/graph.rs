//! Sending whole graphs.
//!
//! Graphs are described in the FBP JSON graph format and uploaded to a
//! runtime as a sequence of primitive `graph` protocol commands.

use std::collections::BTreeMap;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::commands::GraphCommands;
use crate::errors::ClientError;

/// A graph in FBP JSON format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub properties: GraphProperties,
    #[serde(default)]
    pub inports: BTreeMap<String, ExportedPort>,
    #[serde(default)]
    pub outports: BTreeMap<String, ExportedPort>,
    #[serde(default)]
    pub processes: BTreeMap<String, Process>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Component library the graph belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A node of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub component: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A graph port exported under a public name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedPort {
    pub process: String,
    pub port: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// One end of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRef {
    pub process: String,
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// An edge between two processes, or an initial packet when `data` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<PortRef>,
    pub tgt: PortRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl GraphDefinition {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Identifier used for the graph on the runtime.
    pub fn id(&self) -> Option<&str> {
        self.properties
            .id
            .as_deref()
            .or(self.properties.name.as_deref())
    }

    /// Connections between two processes.
    pub fn edges(&self) -> impl Iterator<Item = (&PortRef, &Connection)> + '_ {
        self.connections
            .iter()
            .filter_map(|connection| connection.src.as_ref().map(|src| (src, connection)))
    }

    /// Initial packets.
    pub fn initializers(&self) -> impl Iterator<Item = (&Value, &Connection)> + '_ {
        self.connections
            .iter()
            .filter(|connection| connection.src.is_none())
            .filter_map(|connection| connection.data.as_ref().map(|data| (data, connection)))
    }
}

fn endpoint(port: &PortRef) -> Value {
    let mut end = Map::new();
    end.insert("node".into(), Value::String(port.process.clone()));
    end.insert("port".into(), Value::String(port.port.clone()));
    if let Some(index) = port.index {
        end.insert("index".into(), Value::from(index));
    }
    Value::Object(end)
}

impl GraphCommands<'_> {
    /// Replace the runtime's copy of `graph`.
    ///
    /// Sends `clear`, then every node, edge, initial packet, exported inport
    /// and exported outport. Each stage is acknowledged before the next
    /// begins; the first failure aborts the upload.
    pub async fn send(&self, graph: &GraphDefinition, main: bool) -> Result<(), ClientError> {
        let id = graph
            .id()
            .ok_or_else(|| ClientError::InvalidDefinition("Graph id or name is required".to_string()))?
            .to_string();
        let properties = &graph.properties;
        let library = properties
            .project
            .clone()
            .or_else(|| self.client.definition().namespace);

        self.clear(json!({
            "id": id,
            "name": properties.name.as_deref().unwrap_or(&id),
            "main": main,
            "library": library,
            "icon": properties.icon.as_deref().unwrap_or_default(),
            "description": properties.description.as_deref().unwrap_or_default(),
        }))
        .await?;

        try_join_all(graph.processes.iter().map(|(name, process)| {
            self.addnode(json!({
                "id": name,
                "component": process.component,
                "metadata": process.metadata,
                "graph": id,
            }))
        }))
        .await?;

        try_join_all(graph.edges().map(|(src, edge)| {
            self.addedge(json!({
                "src": endpoint(src),
                "tgt": endpoint(&edge.tgt),
                "metadata": edge.metadata,
                "graph": id,
            }))
        }))
        .await?;

        try_join_all(graph.initializers().map(|(data, iip)| {
            self.addinitial(json!({
                "src": {"data": data},
                "tgt": endpoint(&iip.tgt),
                "metadata": iip.metadata,
                "graph": id,
            }))
        }))
        .await?;

        try_join_all(graph.inports.iter().map(|(public, port)| {
            self.addinport(json!({
                "public": public,
                "node": port.process,
                "port": port.port,
                "metadata": port.metadata,
                "graph": id,
            }))
        }))
        .await?;

        try_join_all(graph.outports.iter().map(|(public, port)| {
            self.addoutport(json!({
                "public": public,
                "node": port.process,
                "port": port.port,
                "metadata": port.metadata,
                "graph": id,
            }))
        }))
        .await?;

        Ok(())
    }
}
