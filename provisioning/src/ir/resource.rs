use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::cluster::{AccessEntrySpec, AddonDescriptor, ClusterSpec};
use crate::label::Label;
use crate::network::{NetworkSpec, SubnetsSpec};
use crate::nodegroup::NodeGroupSpec;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        ResourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        ResourceId(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Label,
    Identity,
    Network,
    Subnets,
    NodeGroup,
    Cluster,
    Addons,
    AccessEntry,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Label => "label",
            ResourceKind::Identity => "identity",
            ResourceKind::Network => "network",
            ResourceKind::Subnets => "subnets",
            ResourceKind::NodeGroup => "node_group",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Addons => "addons",
            ResourceKind::AccessEntry => "access_entry",
        };
        f.write_str(name)
    }
}

/// Data edges carry outputs from prerequisite to dependent; order edges
/// only sequence the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Data,
    Order,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::Data => f.write_str("data"),
            EdgeKind::Order => f.write_str("order"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: ResourceId,
    pub kind: EdgeKind,
}

impl Dependency {
    pub fn data(id: &ResourceId) -> Self {
        Self {
            id: id.clone(),
            kind: EdgeKind::Data,
        }
    }

    pub fn order(id: &ResourceId) -> Self {
        Self {
            id: id.clone(),
            kind: EdgeKind::Order,
        }
    }
}

/// Declared configuration of a node. Fixed once the graph is compiled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    Label { cluster_name: String },
    Identity,
    Network(NetworkSpec),
    Subnets(SubnetsSpec),
    NodeGroup(NodeGroupSpec),
    Cluster(ClusterSpec),
    Addons {
        cluster_name: String,
        addons: Vec<AddonDescriptor>,
    },
    AccessEntry {
        cluster_name: String,
        principal: String,
        entry: AccessEntrySpec,
    },
}

impl NodeConfig {
    pub fn kind(&self) -> ResourceKind {
        match self {
            NodeConfig::Label { .. } => ResourceKind::Label,
            NodeConfig::Identity => ResourceKind::Identity,
            NodeConfig::Network(_) => ResourceKind::Network,
            NodeConfig::Subnets(_) => ResourceKind::Subnets,
            NodeConfig::NodeGroup(_) => ResourceKind::NodeGroup,
            NodeConfig::Cluster(_) => ResourceKind::Cluster,
            NodeConfig::Addons { .. } => ResourceKind::Addons,
            NodeConfig::AccessEntry { .. } => ResourceKind::AccessEntry,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceNode {
    pub id: ResourceId,
    /// Name of the remote object, derived from the label at compile time.
    pub remote_name: String,
    pub config: NodeConfig,
    #[serde(skip)]
    pub label: Arc<Label>,
    /// Declaration order is kept; the walk does not depend on it.
    pub depends_on: Vec<Dependency>,
}

impl ResourceNode {
    pub fn kind(&self) -> ResourceKind {
        self.config.kind()
    }
}
