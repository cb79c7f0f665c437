//! Tag keys that external controllers key off. Missing keys do not fail
//! anything at creation time; the load-balancer controller and the cluster
//! autoscaler simply never discover the resource.

use super::TagSet;
use crate::util::ProvisionError;

pub const ROLE_ELB: &str = "kubernetes.io/role/elb";
pub const ROLE_INTERNAL_ELB: &str = "kubernetes.io/role/internal-elb";
pub const AUTOSCALER_ENABLED: &str = "k8s.io/cluster-autoscaler/enabled";

pub fn cluster_ownership_key(cluster: &str) -> String {
    format!("kubernetes.io/cluster/{cluster}")
}

pub fn autoscaler_ownership_key(cluster: &str) -> String {
    format!("k8s.io/cluster-autoscaler/{cluster}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagRole {
    Network,
    PublicSubnet,
    PrivateSubnet,
    NodeGroup { autoscaler_discovery: bool },
    Cluster,
}

pub fn reserved_tags(role: TagRole, cluster: &str) -> TagSet {
    let mut tags = TagSet::new();
    match role {
        TagRole::Network => {
            tags.insert(cluster_ownership_key(cluster), "shared".into());
        }
        TagRole::PublicSubnet => {
            tags.insert(cluster_ownership_key(cluster), "shared".into());
            tags.insert(ROLE_ELB.into(), "1".into());
        }
        TagRole::PrivateSubnet => {
            tags.insert(cluster_ownership_key(cluster), "shared".into());
            tags.insert(ROLE_INTERNAL_ELB.into(), "1".into());
        }
        TagRole::NodeGroup {
            autoscaler_discovery,
        } => {
            tags.insert(cluster_ownership_key(cluster), "owned".into());
            if autoscaler_discovery {
                tags.insert(AUTOSCALER_ENABLED.into(), "true".into());
                tags.insert(autoscaler_ownership_key(cluster), "owned".into());
            }
        }
        TagRole::Cluster => {}
    }
    tags
}

pub fn verify_reserved_tags(role: TagRole, cluster: &str, tags: &TagSet) -> Result<(), ProvisionError> {
    for (key, value) in reserved_tags(role, cluster) {
        match tags.get(&key) {
            Some(actual) if *actual == value => {}
            Some(actual) => {
                return Err(ProvisionError::validation(format!(
                    "reserved tag {key} must be {value:?}, found {actual:?}"
                )))
            }
            None => {
                return Err(ProvisionError::validation(format!(
                    "reserved tag {key} is missing"
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_role_markers() {
        let public = reserved_tags(TagRole::PublicSubnet, "eg-eks-test-cluster");
        assert_eq!(public[ROLE_ELB], "1");
        assert!(!public.contains_key(ROLE_INTERNAL_ELB));
        assert_eq!(public["kubernetes.io/cluster/eg-eks-test-cluster"], "shared");

        let private = reserved_tags(TagRole::PrivateSubnet, "eg-eks-test-cluster");
        assert_eq!(private[ROLE_INTERNAL_ELB], "1");
        assert!(!private.contains_key(ROLE_ELB));
    }

    #[test]
    fn test_autoscaler_keys_only_when_enabled() {
        let off = reserved_tags(TagRole::NodeGroup { autoscaler_discovery: false }, "c");
        assert!(!off.contains_key(AUTOSCALER_ENABLED));
        let on = reserved_tags(TagRole::NodeGroup { autoscaler_discovery: true }, "c");
        assert_eq!(on[AUTOSCALER_ENABLED], "true");
        assert_eq!(on["k8s.io/cluster-autoscaler/c"], "owned");
    }

    #[test]
    fn test_verify_detects_masked_marker() {
        let mut tags = reserved_tags(TagRole::PublicSubnet, "c");
        assert!(verify_reserved_tags(TagRole::PublicSubnet, "c", &tags).is_ok());
        tags.insert(ROLE_ELB.into(), "0".into());
        assert!(verify_reserved_tags(TagRole::PublicSubnet, "c", &tags).is_err());
        tags.remove(ROLE_ELB);
        assert!(verify_reserved_tags(TagRole::PublicSubnet, "c", &tags).is_err());
    }
}
