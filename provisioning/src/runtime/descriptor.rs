//! Turns a compiled node plus its dependency outputs into provider requests.

use crate::cluster::access::resolve_principal;
use crate::ir::{DependencyOutputs, NodeConfig, ResourceNode};
use crate::label::{reserved_tags, verify_reserved_tags, TagRole, TagSet};
use crate::network::{plan_subnets, Ipv4Cidr};
use crate::util::ProvisionError;

use super::provider::{
    AccessEntryRequest, AddonRequest, ClusterRequest, NetworkRequest, NodeGroupRequest,
    RemoteKey, RemoteKind, ResourceRequest, SubnetsRequest,
};

fn named_tags(node: &ResourceNode, name: &str, reserved: TagSet) -> TagSet {
    let mut extra = reserved;
    extra.insert("Name".into(), name.to_string());
    node.label.tags_with(extra)
}

/// Request for a node backed by exactly one remote object.
pub fn build_request(
    node: &ResourceNode,
    deps: &DependencyOutputs,
) -> Result<ResourceRequest, ProvisionError> {
    let request = match &node.config {
        NodeConfig::Network(spec) => {
            let cluster_name = &deps.label()?.cluster_name;
            let tags = named_tags(node, &node.remote_name, reserved_tags(TagRole::Network, cluster_name));
            verify_reserved_tags(TagRole::Network, cluster_name, &tags)?;
            ResourceRequest::Network(NetworkRequest {
                name: node.remote_name.clone(),
                cidr_block: spec.cidr()?,
                tags,
            })
        }
        NodeConfig::Subnets(spec) => {
            let network = deps.network()?;
            let cluster_name = &deps.label()?.cluster_name;
            let vpc: Ipv4Cidr = network.cidr_block.parse()?;
            let layout = plan_subnets(vpc, &spec.availability_zones, &node.label, cluster_name)?;
            for subnet in &layout.public {
                verify_reserved_tags(TagRole::PublicSubnet, cluster_name, &subnet.tags)?;
            }
            for subnet in &layout.private {
                verify_reserved_tags(TagRole::PrivateSubnet, cluster_name, &subnet.tags)?;
            }
            ResourceRequest::Subnets(SubnetsRequest {
                name: node.remote_name.clone(),
                network_id: network.network_id.clone(),
                internet_gateway_id: network.internet_gateway_id.clone(),
                layout,
                nat_gateway_enabled: spec.nat_gateway_enabled,
            })
        }
        NodeConfig::NodeGroup(spec) => {
            spec.validate()?;
            let subnets = deps.subnets()?;
            let cluster_name = deps.label()?.cluster_name.clone();
            let role = TagRole::NodeGroup {
                autoscaler_discovery: spec.cluster_autoscaler_enabled,
            };
            let tags = named_tags(node, &node.remote_name, reserved_tags(role, &cluster_name));
            verify_reserved_tags(role, &cluster_name, &tags)?;
            ResourceRequest::NodeGroup(NodeGroupRequest {
                name: node.remote_name.clone(),
                cluster_name,
                subnet_ids: subnets.private_subnet_ids.clone(),
                instance_types: spec.instance_types.clone(),
                scaling: spec.scaling(),
                tags,
            })
        }
        NodeConfig::Cluster(spec) => {
            let subnets = deps.subnets()?;
            let subnet_ids = subnets
                .public_subnet_ids
                .iter()
                .chain(subnets.private_subnet_ids.iter())
                .cloned()
                .collect();
            ResourceRequest::Cluster(ClusterRequest {
                name: node.remote_name.clone(),
                kubernetes_version: spec.kubernetes_version.trim().to_string(),
                subnet_ids,
                oidc_provider_enabled: spec.oidc_provider_enabled,
                endpoint_public_access: spec.endpoint_public_access,
                tags: named_tags(node, &node.remote_name, TagSet::new()),
            })
        }
        NodeConfig::AccessEntry {
            cluster_name,
            principal,
            entry,
        } => {
            let cluster = deps.cluster()?;
            let caller = deps.identity().ok().map(|id| id.principal_arn.as_str());
            ResourceRequest::AccessEntry(AccessEntryRequest {
                name: node.remote_name.clone(),
                cluster_name: cluster.cluster_name.clone(),
                principal_arn: resolve_principal(principal, caller)?,
                kubernetes_groups: entry.kubernetes_groups.clone(),
                associations: entry.associations(),
                tags: named_tags(node, cluster_name, TagSet::new()),
            })
        }
        NodeConfig::Label { .. } | NodeConfig::Identity | NodeConfig::Addons { .. } => {
            return Err(ProvisionError::Fatal(format!(
                "{} ({}) is not a single remote object",
                node.id,
                node.kind()
            )))
        }
    };
    Ok(request)
}

/// One request per add-on, in list order.
pub fn addon_requests(
    node: &ResourceNode,
    deps: &DependencyOutputs,
) -> Result<Vec<AddonRequest>, ProvisionError> {
    let NodeConfig::Addons { addons, .. } = &node.config else {
        return Err(ProvisionError::Fatal(format!("{} has no add-ons", node.id)));
    };
    let cluster = deps.cluster()?;
    Ok(addons
        .iter()
        .map(|addon| AddonRequest {
            cluster_name: cluster.cluster_name.clone(),
            addon: addon.clone(),
            tags: named_tags(node, &cluster.cluster_name, TagSet::new()),
        })
        .collect())
}

/// Remote objects owned by a node, in teardown order. Names are fixed at
/// compile time so nothing upstream needs to be read.
pub fn remote_keys(node: &ResourceNode) -> Vec<RemoteKey> {
    match &node.config {
        NodeConfig::Label { .. } | NodeConfig::Identity => Vec::new(),
        NodeConfig::Network(_) => vec![RemoteKey::new(RemoteKind::Network, node.remote_name.as_str())],
        NodeConfig::Subnets(_) => vec![RemoteKey::new(RemoteKind::Subnets, node.remote_name.as_str())],
        NodeConfig::NodeGroup(_) => vec![RemoteKey::new(RemoteKind::NodeGroup, node.remote_name.as_str())],
        NodeConfig::Cluster(_) => vec![RemoteKey::new(RemoteKind::Cluster, node.remote_name.as_str())],
        NodeConfig::Addons {
            cluster_name,
            addons,
        } => addons
            .iter()
            .rev()
            .map(|a| RemoteKey::new(RemoteKind::Addon, format!("{cluster_name}/{}", a.name)))
            .collect(),
        NodeConfig::AccessEntry { .. } => {
            vec![RemoteKey::new(RemoteKind::AccessEntry, node.remote_name.as_str())]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{LabelOutputs, NetworkOutputs, ResourceId, ResourceOutputs};
    use crate::label::reserved::{ROLE_ELB, ROLE_INTERNAL_ELB};
    use crate::meta::parse_document;
    use crate::planner::compile_stack;

    const STACK: &str = r#"
label: {namespace: eg, name: eks, stage: test}
resources:
  - id: vpc
    kind: network
    cidr_block: 172.16.0.0/16
  - id: subnets
    kind: subnets
    availability_zones: [us-east-2a, us-east-2b, us-east-2c]
  - id: workers
    kind: node_group
    instance_types: [t3.medium]
    min_size: 1
    desired_size: 3
    max_size: 3
    cluster_autoscaler_enabled: true
  - id: eks
    kind: cluster
    kubernetes_version: "1.30"
    addons:
      - {name: vpc-cni, version: v1.18.1-eksbuild.1}
      - {name: coredns, version: v1.11.1-eksbuild.9}
"#;

    fn label_outputs() -> ResourceOutputs {
        ResourceOutputs::Label(LabelOutputs {
            id: "eg-eks-test".into(),
            cluster_name: "eg-eks-test-cluster".into(),
            tags: TagSet::new(),
        })
    }

    #[test]
    fn test_subnet_request_tags_roles() {
        let out = compile_stack(&parse_document(STACK).unwrap()).unwrap();
        let node = out.graph.node(&"subnets".into()).unwrap();
        let mut deps = DependencyOutputs::new(node.id.clone());
        deps.insert("label".into(), label_outputs());
        deps.insert(
            "vpc".into(),
            ResourceOutputs::Network(NetworkOutputs {
                network_id: "vpc-1".into(),
                internet_gateway_id: "igw-1".into(),
                cidr_block: "172.16.0.0/16".into(),
            }),
        );
        let ResourceRequest::Subnets(req) = build_request(node, &deps).unwrap() else {
            panic!("expected a subnets request");
        };
        assert_eq!(req.layout.public.len(), 3);
        assert_eq!(req.layout.private.len(), 3);
        assert!(req.layout.public.iter().all(|s| s.tags.get(ROLE_ELB).map(String::as_str) == Some("1")));
        assert!(req
            .layout
            .private
            .iter()
            .all(|s| s.tags.get(ROLE_INTERNAL_ELB).map(String::as_str) == Some("1")));
    }

    #[test]
    fn test_missing_data_dependency_is_not_ready() {
        let out = compile_stack(&parse_document(STACK).unwrap()).unwrap();
        let node = out.graph.node(&"workers".into()).unwrap();
        let mut deps = DependencyOutputs::new(node.id.clone());
        deps.insert(ResourceId::from("label"), label_outputs());
        assert!(matches!(
            build_request(node, &deps),
            Err(ProvisionError::DependencyNotReady { .. })
        ));
    }

    #[test]
    fn test_addon_keys_reverse_for_teardown() {
        let out = compile_stack(&parse_document(STACK).unwrap()).unwrap();
        let node = out.graph.node(&"eks/addons".into()).unwrap();
        let names: Vec<String> = remote_keys(node).into_iter().map(|k| k.name).collect();
        assert_eq!(
            names,
            vec!["eg-eks-test-cluster/coredns", "eg-eks-test-cluster/vpc-cni"]
        );
    }
}
