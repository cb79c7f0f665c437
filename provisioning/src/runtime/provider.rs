//! Seam to the external provisioning API. Every call is idempotent; state
//! is observed by polling `read` until it leaves `Pending`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::{AddonDescriptor, ConflictPolicy, PolicyAssociation};
use crate::ir::ResourceOutputs;
use crate::label::TagSet;
use crate::network::{Ipv4Cidr, SubnetLayout};
use crate::nodegroup::ScalingConfig;
use crate::util::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    Network,
    Subnets,
    NodeGroup,
    Cluster,
    Addon,
    AccessEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteKey {
    pub kind: RemoteKind,
    pub name: String,
}

impl RemoteKey {
    pub fn new(kind: RemoteKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl RemoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteKind::Network => "network",
            RemoteKind::Subnets => "subnets",
            RemoteKind::NodeGroup => "node_group",
            RemoteKind::Cluster => "cluster",
            RemoteKind::Addon => "addon",
            RemoteKind::AccessEntry => "access_entry",
        }
    }
}

impl fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub name: String,
    pub cidr_block: Ipv4Cidr,
    pub tags: TagSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetsRequest {
    pub name: String,
    pub network_id: String,
    pub internet_gateway_id: String,
    pub layout: SubnetLayout,
    pub nat_gateway_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupRequest {
    pub name: String,
    pub cluster_name: String,
    pub subnet_ids: Vec<String>,
    pub instance_types: Vec<String>,
    pub scaling: ScalingConfig,
    pub tags: TagSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub name: String,
    pub kubernetes_version: String,
    /// Public subnets first, then private, each in zone order.
    pub subnet_ids: Vec<String>,
    pub oidc_provider_enabled: bool,
    pub endpoint_public_access: bool,
    pub tags: TagSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonRequest {
    pub cluster_name: String,
    pub addon: AddonDescriptor,
    pub tags: TagSet,
}

impl AddonRequest {
    pub fn name(&self) -> String {
        format!("{}/{}", self.cluster_name, self.addon.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntryRequest {
    pub name: String,
    pub cluster_name: String,
    pub principal_arn: String,
    pub kubernetes_groups: Vec<String>,
    pub associations: Vec<PolicyAssociation>,
    pub tags: TagSet,
}

/// Desired configuration of one remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceRequest {
    Network(NetworkRequest),
    Subnets(SubnetsRequest),
    NodeGroup(NodeGroupRequest),
    Cluster(ClusterRequest),
    Addon(AddonRequest),
    AccessEntry(AccessEntryRequest),
}

impl ResourceRequest {
    pub fn key(&self) -> RemoteKey {
        match self {
            ResourceRequest::Network(r) => RemoteKey::new(RemoteKind::Network, r.name.as_str()),
            ResourceRequest::Subnets(r) => RemoteKey::new(RemoteKind::Subnets, r.name.as_str()),
            ResourceRequest::NodeGroup(r) => RemoteKey::new(RemoteKind::NodeGroup, r.name.as_str()),
            ResourceRequest::Cluster(r) => RemoteKey::new(RemoteKind::Cluster, r.name.as_str()),
            ResourceRequest::Addon(r) => RemoteKey::new(RemoteKind::Addon, r.name()),
            ResourceRequest::AccessEntry(r) => RemoteKey::new(RemoteKind::AccessEntry, r.name.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RemotePhase {
    Pending,
    Ready,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observed {
    pub phase: RemotePhase,
    /// Configuration the provider last accepted.
    pub applied: ResourceRequest,
    /// Present once the object is ready.
    pub outputs: Option<ResourceOutputs>,
}

/// Whether an observed object already matches the desired request.
/// Conflict policies are directives for a call, not state, and
/// `configuration_values` is not compared when the update policy keeps the
/// installed values.
pub fn is_converged(desired: &ResourceRequest, applied: &ResourceRequest) -> bool {
    match (desired, applied) {
        (ResourceRequest::Addon(want), ResourceRequest::Addon(have)) => {
            let preserve = want.addon.resolve_conflicts_on_update == ConflictPolicy::Preserve;
            want.cluster_name == have.cluster_name
                && want.tags == have.tags
                && want.addon.name == have.addon.name
                && want.addon.version == have.addon.version
                && want.addon.service_account_role_arn == have.addon.service_account_role_arn
                && (preserve || want.addon.configuration_values == have.addon.configuration_values)
        }
        _ => desired == applied,
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// `None` when the object does not exist.
    async fn read(&self, key: &RemoteKey) -> Result<Option<Observed>, ProvisionError>;

    async fn create(&self, request: &ResourceRequest) -> Result<(), ProvisionError>;

    async fn update(&self, request: &ResourceRequest) -> Result<(), ProvisionError>;

    /// Deleting an absent object succeeds.
    async fn delete(&self, key: &RemoteKey) -> Result<(), ProvisionError>;
}
