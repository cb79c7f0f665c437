use crate::cluster::{ClusterSpec, CALLER_PRINCIPAL};
use crate::ir::{Dependency, EdgeKind, NodeConfig, ResourceGraph, ResourceId, ResourceNode};
use crate::label::Label;
use crate::meta::{ResourceDecl, ResourceSpec, StackDocument};
use crate::network::plan_subnets;
use crate::util::ProvisionError;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub const LABEL_NODE: &str = "label";
pub const IMPLICIT_IDENTITY_NODE: &str = "identity";

pub struct CompileOutputs {
    pub label: Arc<Label>,
    pub cluster_name: String,
    pub region: String,
    pub graph: ResourceGraph,
}

fn add_dependency(deps: &mut Vec<Dependency>, dep: Dependency) {
    match deps.iter_mut().find(|d| d.id == dep.id) {
        Some(existing) => {
            if dep.kind == EdgeKind::Data {
                existing.kind = EdgeKind::Data;
            }
        }
        None => deps.push(dep),
    }
}

fn single<'a>(
    decls: &'a [ResourceDecl],
    kind: &str,
) -> Result<Option<&'a ResourceDecl>, ProvisionError> {
    let mut found = decls.iter().filter(|d| d.spec.kind_name() == kind);
    let first = found.next();
    if let Some(second) = found.next() {
        return Err(ProvisionError::validation(format!(
            "only one {kind} resource is supported, found {} and {}",
            first.map(|d| d.id.as_str()).unwrap_or_default(),
            second.id
        )));
    }
    Ok(first)
}

fn require<'a>(
    decl: Option<&'a ResourceDecl>,
    kind: &str,
    needed_by: &str,
) -> Result<&'a ResourceDecl, ProvisionError> {
    decl.ok_or_else(|| {
        ProvisionError::validation(format!("{needed_by} needs a {kind} resource in the stack"))
    })
}

fn validate_ids(decls: &[ResourceDecl]) -> Result<(), ProvisionError> {
    let mut seen = BTreeSet::new();
    for decl in decls {
        let id = decl.id.as_str();
        if id.trim().is_empty() {
            return Err(ProvisionError::validation("resource ids must not be empty"));
        }
        if id == LABEL_NODE || id.contains('/') {
            return Err(ProvisionError::validation(format!(
                "resource id {id:?} is reserved or contains '/'"
            )));
        }
        if !seen.insert(id) {
            return Err(ProvisionError::validation(format!("resource id {id} is declared twice")));
        }
    }
    Ok(())
}

/// Validate a stack document and compile it into its resource graph.
/// Nothing here talks to a provider, so every error is raised before the
/// first external call.
pub fn compile_stack(doc: &StackDocument) -> Result<CompileOutputs, ProvisionError> {
    let label = Arc::new(Label::new(&doc.label)?);
    let cluster_name = label.with_attributes(&["cluster"]).id().to_string();
    let decls = &doc.resources;
    validate_ids(decls)?;

    let identity = single(decls, "identity")?;
    let network = single(decls, "network")?;
    let subnets = single(decls, "subnets")?;
    let cluster = single(decls, "cluster")?;
    let node_groups: Vec<&ResourceDecl> = decls
        .iter()
        .filter(|d| matches!(d.spec, ResourceSpec::NodeGroup(_)))
        .collect();

    for decl in decls {
        match &decl.spec {
            ResourceSpec::Identity => {}
            ResourceSpec::Network(spec) => {
                spec.cidr()?;
            }
            ResourceSpec::Subnets(spec) => {
                spec.validate()?;
                let network = require(network, "network", &decl.id)?;
                if let ResourceSpec::Network(net) = &network.spec {
                    // Address-space exhaustion is known before anything is created.
                    plan_subnets(net.cidr()?, &spec.availability_zones, &label, &cluster_name)?;
                }
            }
            ResourceSpec::NodeGroup(spec) => {
                spec.validate().map_err(|e| match e {
                    ProvisionError::Validation(msg) => {
                        ProvisionError::Validation(format!("{}: {msg}", decl.id))
                    }
                    other => other,
                })?;
                require(subnets, "subnets", &decl.id)?;
            }
            ResourceSpec::Cluster(spec) => {
                spec.validate()?;
                require(subnets, "subnets", &decl.id)?;
            }
        }
    }

    let label_id = ResourceId::new(LABEL_NODE);
    let mut nodes = vec![ResourceNode {
        id: label_id.clone(),
        remote_name: label.id().to_string(),
        config: NodeConfig::Label {
            cluster_name: cluster_name.clone(),
        },
        label: label.clone(),
        depends_on: Vec::new(),
    }];

    let needs_caller = cluster
        .and_then(|d| match &d.spec {
            ResourceSpec::Cluster(spec) => Some(spec.uses_caller_principal()),
            _ => None,
        })
        .unwrap_or(false);
    let identity_id = match identity {
        Some(decl) => Some(ResourceId::new(decl.id.as_str())),
        None if needs_caller => Some(ResourceId::new(IMPLICIT_IDENTITY_NODE)),
        None => None,
    };
    if identity.is_none() {
        if let Some(id) = &identity_id {
            if decls.iter().any(|d| d.id == id.as_str()) {
                return Err(ProvisionError::validation(format!(
                    "{CALLER_PRINCIPAL} needs an identity resource; id {id} is taken"
                )));
            }
            nodes.push(ResourceNode {
                id: id.clone(),
                remote_name: id.to_string(),
                config: NodeConfig::Identity,
                label: label.clone(),
                depends_on: Vec::new(),
            });
        }
    }

    let network_id = network.map(|d| ResourceId::new(d.id.as_str()));
    let subnets_id = subnets.map(|d| ResourceId::new(d.id.as_str()));
    let node_group_ids: Vec<ResourceId> = node_groups
        .iter()
        .map(|d| ResourceId::new(d.id.as_str()))
        .collect();

    for decl in decls {
        let id = ResourceId::new(decl.id.as_str());
        let mut deps = Vec::new();
        let (config, remote_name) = match &decl.spec {
            ResourceSpec::Identity => (NodeConfig::Identity, decl.id.clone()),
            ResourceSpec::Network(spec) => {
                add_dependency(&mut deps, Dependency::data(&label_id));
                (NodeConfig::Network(spec.clone()), label.id().to_string())
            }
            ResourceSpec::Subnets(spec) => {
                if let Some(network_id) = &network_id {
                    add_dependency(&mut deps, Dependency::data(network_id));
                }
                add_dependency(&mut deps, Dependency::data(&label_id));
                (NodeConfig::Subnets(spec.clone()), label.id().to_string())
            }
            ResourceSpec::NodeGroup(spec) => {
                if let Some(subnets_id) = &subnets_id {
                    add_dependency(&mut deps, Dependency::data(subnets_id));
                }
                // The pool needs the cluster's name, not the cluster itself.
                add_dependency(&mut deps, Dependency::data(&label_id));
                let name = label.with_attributes(&[decl.id.as_str()]).id().to_string();
                (NodeConfig::NodeGroup(spec.clone()), name)
            }
            ResourceSpec::Cluster(spec) => {
                if let Some(subnets_id) = &subnets_id {
                    add_dependency(&mut deps, Dependency::data(subnets_id));
                }
                add_dependency(&mut deps, Dependency::data(&label_id));
                nodes.extend(cluster_children(
                    &id,
                    spec,
                    &cluster_name,
                    &label,
                    &node_group_ids,
                    identity_id.as_ref(),
                )?);
                (NodeConfig::Cluster(spec.clone()), cluster_name.clone())
            }
        };
        for explicit in &decl.depends_on {
            add_dependency(&mut deps, Dependency::order(&ResourceId::new(explicit.as_str())));
        }
        nodes.push(ResourceNode {
            id,
            remote_name,
            config,
            label: label.clone(),
            depends_on: deps,
        });
    }

    let graph = ResourceGraph::build(nodes)?;
    debug!(nodes = graph.len(), label = %label.id(), "compiled stack");

    Ok(CompileOutputs {
        label,
        cluster_name,
        region: doc.region.clone(),
        graph,
    })
}

/// The add-on installer and one node per access entry, both hanging off the
/// control plane.
fn cluster_children(
    cluster_id: &ResourceId,
    spec: &ClusterSpec,
    cluster_name: &str,
    label: &Arc<Label>,
    node_group_ids: &[ResourceId],
    identity_id: Option<&ResourceId>,
) -> Result<Vec<ResourceNode>, ProvisionError> {
    let mut children = Vec::new();

    if !spec.addons.is_empty() {
        let mut deps = vec![Dependency::data(cluster_id)];
        let prerequisites: Vec<ResourceId> = match &spec.addons_depends_on {
            Some(ids) => ids.iter().map(|id| ResourceId::new(id.as_str())).collect(),
            None => node_group_ids.to_vec(),
        };
        for prerequisite in &prerequisites {
            add_dependency(&mut deps, Dependency::order(prerequisite));
        }
        children.push(ResourceNode {
            id: ResourceId::new(format!("{cluster_id}/addons")),
            remote_name: cluster_name.to_string(),
            config: NodeConfig::Addons {
                cluster_name: cluster_name.to_string(),
                addons: spec.addons.clone(),
            },
            label: label.clone(),
            depends_on: deps,
        });
    }

    for (principal, entry) in &spec.access_entries {
        let mut deps = vec![Dependency::data(cluster_id)];
        if principal == CALLER_PRINCIPAL {
            let identity_id = identity_id.ok_or_else(|| {
                ProvisionError::validation(format!("{CALLER_PRINCIPAL} needs an identity resource"))
            })?;
            add_dependency(&mut deps, Dependency::data(identity_id));
        }
        children.push(ResourceNode {
            id: ResourceId::new(format!("{cluster_id}/access/{principal}")),
            remote_name: format!("{cluster_name}/{principal}"),
            config: NodeConfig::AccessEntry {
                cluster_name: cluster_name.to_string(),
                principal: principal.clone(),
                entry: entry.clone(),
            },
            label: label.clone(),
            depends_on: deps,
        });
    }

    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::parse_document;

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
  - id: eks
    kind: cluster
    kubernetes_version: "1.30"
    access_entries:
      "@caller":
        policies:
          ClusterAdmin: {type: cluster}
    addons:
      - {name: vpc-cni, version: v1.18.1-eksbuild.1}
      - {name: coredns, version: v1.11.1-eksbuild.9}
"#;

    fn compile(raw: &str) -> Result<CompileOutputs, ProvisionError> {
        compile_stack(&parse_document(raw).unwrap())
    }

    #[test]
    fn test_remote_names_follow_the_label() {
        let out = compile(STACK).unwrap();
        assert_eq!(out.cluster_name, "eg-eks-test-cluster");
        let graph = &out.graph;
        assert_eq!(graph.node(&"vpc".into()).unwrap().remote_name, "eg-eks-test");
        assert_eq!(graph.node(&"workers".into()).unwrap().remote_name, "eg-eks-test-workers");
        assert_eq!(graph.node(&"eks".into()).unwrap().remote_name, "eg-eks-test-cluster");
    }

    #[test]
    fn test_implied_edges() {
        let out = compile(STACK).unwrap();
        let g = &out.graph;
        assert_eq!(
            g.prerequisites(&"workers".into()),
            vec![("label".into(), EdgeKind::Data), ("subnets".into(), EdgeKind::Data)]
        );
        assert_eq!(
            g.prerequisites(&"eks/addons".into()),
            vec![("eks".into(), EdgeKind::Data), ("workers".into(), EdgeKind::Order)]
        );
        assert_eq!(
            g.prerequisites(&"eks/access/@caller".into()),
            vec![("eks".into(), EdgeKind::Data), ("identity".into(), EdgeKind::Data)]
        );
        // Node pool and control plane are siblings.
        assert!(!g.transitive_dependents(&"eks".into()).contains(&ResourceId::from("workers")));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let a = compile(STACK).unwrap();
        let b = compile(STACK).unwrap();
        assert_eq!(a.graph.topological_order(), b.graph.topological_order());
        assert_eq!(a.label, b.label);
    }

    #[test]
    fn test_scaling_bounds_fail_fast() {
        let bad = STACK.replace("min_size: 1", "min_size: 4");
        let err = compile(&bad).err().unwrap();
        assert!(matches!(err, ProvisionError::Validation(msg) if msg.starts_with("workers")));
    }

    #[test]
    fn test_explicit_cycle_is_rejected() {
        let bad = STACK.replace(
            "    cidr_block: 172.16.0.0/16\n",
            "    cidr_block: 172.16.0.0/16\n    depends_on: [eks]\n",
        );
        assert!(matches!(compile(&bad), Err(ProvisionError::Validation(_))));
    }

    #[test]
    fn test_too_small_network_is_capacity_exhausted() {
        let bad = STACK.replace("172.16.0.0/16", "172.16.0.0/27");
        assert!(matches!(compile(&bad), Err(ProvisionError::CapacityExhausted { .. })));
    }

    #[test]
    fn test_subnets_need_a_network() {
        let raw = "label: {name: eks}\nresources:\n  - id: subnets\n    kind: subnets\n    availability_zones: [a]\n";
        assert!(matches!(compile(raw), Err(ProvisionError::Validation(_))));
    }
}
