use serde::{Deserialize, Serialize};

use crate::cluster::ClusterSpec;
use crate::label::LabelInputs;
use crate::network::{NetworkSpec, SubnetsSpec};
use crate::nodegroup::NodeGroupSpec;

fn default_region() -> String {
    "us-east-2".to_string()
}

/// Declarative description of one cluster stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackDocument {
    pub label: LabelInputs,
    #[serde(default = "default_region")]
    pub region: String,
    pub resources: Vec<ResourceDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub id: String,
    #[serde(flatten)]
    pub spec: ResourceSpec,
    /// Extra ordering on top of the dependencies implied by `kind`.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Identity,
    Network(NetworkSpec),
    Subnets(SubnetsSpec),
    NodeGroup(NodeGroupSpec),
    Cluster(ClusterSpec),
}

impl ResourceSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResourceSpec::Identity => "identity",
            ResourceSpec::Network(_) => "network",
            ResourceSpec::Subnets(_) => "subnets",
            ResourceSpec::NodeGroup(_) => "node_group",
            ResourceSpec::Cluster(_) => "cluster",
        }
    }
}
