use serde::{Deserialize, Serialize};
use std::fmt;

use crate::util::ProvisionError;

/// How the provider resolves an add-on whose fields already exist in the
/// cluster with different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictPolicy {
    /// Abort on conflict and leave the existing installation in place.
    None,
    #[default]
    Overwrite,
    /// Keep existing configuration values. Valid on update only.
    Preserve,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::None => write!(f, "NONE"),
            ConflictPolicy::Overwrite => write!(f, "OVERWRITE"),
            ConflictPolicy::Preserve => write!(f, "PRESERVE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub resolve_conflicts_on_create: ConflictPolicy,
    #[serde(default)]
    pub resolve_conflicts_on_update: ConflictPolicy,
    /// Role bound to the add-on's service account.
    #[serde(default)]
    pub service_account_role_arn: Option<String>,
    /// JSON document handed to the add-on as-is.
    #[serde(default)]
    pub configuration_values: Option<String>,
}

impl AddonDescriptor {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            resolve_conflicts_on_create: ConflictPolicy::default(),
            resolve_conflicts_on_update: ConflictPolicy::default(),
            service_account_role_arn: None,
            configuration_values: None,
        }
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::validation("add-on name must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(ProvisionError::validation(format!(
                "add-on {} needs a version",
                self.name
            )));
        }
        if self.resolve_conflicts_on_create == ConflictPolicy::Preserve {
            return Err(ProvisionError::validation(format!(
                "add-on {}: PRESERVE is only valid for resolve_conflicts_on_update",
                self.name
            )));
        }
        if let Some(values) = &self.configuration_values {
            serde_json::from_str::<serde_json::Value>(values).map_err(|e| {
                ProvisionError::validation(format!(
                    "add-on {}: configuration_values is not valid JSON: {e}",
                    self.name
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_wire_names() {
        let policy: ConflictPolicy = serde_yaml::from_str("OVERWRITE").unwrap();
        assert_eq!(policy, ConflictPolicy::Overwrite);
        let policy: ConflictPolicy = serde_yaml::from_str("NONE").unwrap();
        assert_eq!(policy, ConflictPolicy::None);
        assert_eq!(ConflictPolicy::Preserve.to_string(), "PRESERVE");
    }

    #[test]
    fn test_preserve_rejected_on_create() {
        let mut addon = AddonDescriptor::new("coredns", "v1.11.1-eksbuild.9");
        addon.resolve_conflicts_on_create = ConflictPolicy::Preserve;
        assert!(addon.validate().is_err());
        addon.resolve_conflicts_on_create = ConflictPolicy::None;
        addon.resolve_conflicts_on_update = ConflictPolicy::Preserve;
        assert!(addon.validate().is_ok());
    }

    #[test]
    fn test_configuration_values_must_be_json() {
        let mut addon = AddonDescriptor::new("vpc-cni", "v1.18.1-eksbuild.1");
        addon.configuration_values = Some("{\"env\":{\"ENABLE_PREFIX_DELEGATION\":\"true\"}}".into());
        assert!(addon.validate().is_ok());
        addon.configuration_values = Some("env: true".into());
        assert!(addon.validate().is_err());
    }
}
