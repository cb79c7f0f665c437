use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::util::ProvisionError;

/// Access-entry key that stands for the principal running the apply.
pub const CALLER_PRINCIPAL: &str = "@caller";

const POLICY_ARN_PREFIX: &str = "arn:aws:eks::aws:cluster-access-policy/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    #[default]
    Cluster,
    Namespace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccessScope {
    #[serde(default, rename = "type")]
    pub scope_type: ScopeType,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccessEntrySpec {
    #[serde(default)]
    pub kubernetes_groups: Vec<String>,
    /// Policy name (short `ClusterAdmin` or full ARN) to scope.
    #[serde(default)]
    pub policies: BTreeMap<String, AccessScope>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAssociation {
    pub policy_arn: String,
    pub scope: AccessScope,
}

/// `ClusterAdmin` -> `arn:aws:eks::aws:cluster-access-policy/AmazonEKSClusterAdminPolicy`.
pub fn policy_arn(name: &str) -> String {
    if name.starts_with("arn:") {
        name.to_string()
    } else {
        format!("{POLICY_ARN_PREFIX}AmazonEKS{name}Policy")
    }
}

impl AccessEntrySpec {
    pub fn validate(&self, principal: &str) -> Result<(), ProvisionError> {
        if principal != CALLER_PRINCIPAL && !principal.starts_with("arn:") {
            return Err(ProvisionError::validation(format!(
                "access entry principal {principal} must be an ARN or {CALLER_PRINCIPAL}"
            )));
        }
        if self.policies.is_empty() && self.kubernetes_groups.is_empty() {
            return Err(ProvisionError::validation(format!(
                "access entry {principal} grants neither policies nor groups"
            )));
        }
        for (name, scope) in &self.policies {
            match scope.scope_type {
                ScopeType::Cluster if !scope.namespaces.is_empty() => {
                    return Err(ProvisionError::validation(format!(
                        "policy {name} on {principal}: cluster scope takes no namespaces"
                    )))
                }
                ScopeType::Namespace if scope.namespaces.is_empty() => {
                    return Err(ProvisionError::validation(format!(
                        "policy {name} on {principal}: namespace scope needs namespaces"
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn associations(&self) -> Vec<PolicyAssociation> {
        self.policies
            .iter()
            .map(|(name, scope)| PolicyAssociation {
                policy_arn: policy_arn(name),
                scope: scope.clone(),
            })
            .collect()
    }
}

/// `caller_principal` is the resolved identity's principal ARN, if any.
pub fn resolve_principal(
    principal: &str,
    caller_principal: Option<&str>,
) -> Result<String, ProvisionError> {
    if principal != CALLER_PRINCIPAL {
        return Ok(principal.to_string());
    }
    caller_principal
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::Authentication("caller principal was not resolved".into()))
}
