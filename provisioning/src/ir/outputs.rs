use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ResourceId, ResourceKind};
use crate::label::TagSet;
use crate::util::ProvisionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelOutputs {
    pub id: String,
    pub cluster_name: String,
    pub tags: TagSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityOutputs {
    pub account: String,
    pub caller_arn: String,
    pub principal_arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOutputs {
    pub network_id: String,
    pub internet_gateway_id: String,
    pub cidr_block: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetsOutputs {
    /// In input zone order.
    pub public_subnet_ids: Vec<String>,
    pub private_subnet_ids: Vec<String>,
    pub nat_gateway_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupOutputs {
    pub node_group_name: String,
    pub node_group_arn: String,
    pub desired_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOutputs {
    pub cluster_name: String,
    pub cluster_arn: String,
    pub endpoint: String,
    pub kubernetes_version: String,
    pub oidc_issuer_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonOutputs {
    pub addon_name: String,
    pub addon_version: String,
    pub addon_arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonsOutputs {
    /// Installed add-ons, in list order.
    pub installed: Vec<AddonOutputs>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntryOutputs {
    pub principal_arn: String,
    pub policy_arns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceOutputs {
    Label(LabelOutputs),
    Identity(IdentityOutputs),
    Network(NetworkOutputs),
    Subnets(SubnetsOutputs),
    NodeGroup(NodeGroupOutputs),
    Cluster(ClusterOutputs),
    Addon(AddonOutputs),
    Addons(AddonsOutputs),
    AccessEntry(AccessEntryOutputs),
}

/// Outputs of a node's data dependencies, handed to it at submission.
#[derive(Debug, Clone)]
pub struct DependencyOutputs {
    node: ResourceId,
    values: BTreeMap<ResourceId, ResourceOutputs>,
}

macro_rules! dependency_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty, $kind:expr) => {
        pub fn $fn_name(&self) -> Result<&$ty, ProvisionError> {
            self.values
                .values()
                .find_map(|o| match o {
                    ResourceOutputs::$variant(v) => Some(v),
                    _ => None,
                })
                .ok_or_else(|| self.not_ready($kind))
        }
    };
}

impl DependencyOutputs {
    pub fn new(node: ResourceId) -> Self {
        Self {
            node,
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, id: ResourceId, outputs: ResourceOutputs) {
        self.values.insert(id, outputs);
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceOutputs> {
        self.values.get(id)
    }

    fn not_ready(&self, kind: ResourceKind) -> ProvisionError {
        ProvisionError::DependencyNotReady {
            node: self.node.to_string(),
            dependency: kind.to_string(),
        }
    }

    dependency_accessor!(label, Label, LabelOutputs, ResourceKind::Label);
    dependency_accessor!(identity, Identity, IdentityOutputs, ResourceKind::Identity);
    dependency_accessor!(network, Network, NetworkOutputs, ResourceKind::Network);
    dependency_accessor!(subnets, Subnets, SubnetsOutputs, ResourceKind::Subnets);
    dependency_accessor!(cluster, Cluster, ClusterOutputs, ResourceKind::Cluster);
}
