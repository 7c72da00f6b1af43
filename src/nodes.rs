use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_NODE_COLOR: &str = "#808080";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    #[default]
    Ecu,
    Gateway,
    Sensor,
    Actuator,
    Tester,
    Master,
    #[serde(other)]
    Other,
}

/// A simulated bus participant. The meaning of `address` depends on the
/// protocol: J1939 source address, CANopen node id, or a plain tag on raw CAN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: u32,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub role: NodeRole,
}

fn default_color() -> String {
    DEFAULT_NODE_COLOR.to_string()
}

impl Node {
    pub fn new(id: &str, name: &str, address: u32, role: NodeRole) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            address,
            color: default_color(),
            role,
        }
    }

    pub fn with_color(mut self, color: &str) -> Self {
        self.color = color.to_string();
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Ordered set of nodes, fixed once the session starts.
#[derive(Debug, Default, Clone)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Replace the registry contents. Nodes with an empty or duplicate id are
    /// skipped; returns how many were accepted.
    pub fn init(&mut self, nodes: Vec<Node>) -> usize {
        self.nodes.clear();
        for node in nodes {
            self.add(node);
        }
        self.nodes.len()
    }

    /// Append one node; returns false when it was skipped.
    pub fn add(&mut self, node: Node) -> bool {
        if node.id.trim().is_empty() {
            warn!("Skipping node with empty id");
            return false;
        }
        if self.contains(&node.id) {
            warn!(node = %node.id, "Skipping duplicate node id");
            return false;
        }
        self.nodes.push(node);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn by_address(&self, address: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.address == address)
    }

    pub fn by_role(&self, role: NodeRole) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.role == role)
    }

    pub fn list(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
