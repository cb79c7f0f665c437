//! Control-plane descriptor: platform version, federation, access entries
//! and the ordered add-on list.

pub mod access;
pub mod addon;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::util::ProvisionError;

pub use access::{AccessEntrySpec, AccessScope, PolicyAssociation, ScopeType, CALLER_PRINCIPAL};
pub use addon::{AddonDescriptor, ConflictPolicy};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub kubernetes_version: String,
    #[serde(default)]
    pub oidc_provider_enabled: bool,
    #[serde(default = "default_true")]
    pub endpoint_public_access: bool,
    #[serde(default)]
    pub access_entries: BTreeMap<String, AccessEntrySpec>,
    /// Installed in list order.
    #[serde(default)]
    pub addons: Vec<AddonDescriptor>,
    /// Resources that must be ready before any add-on is installed. When
    /// unset, every node group in the stack.
    #[serde(default)]
    pub addons_depends_on: Option<Vec<String>>,
}

impl ClusterSpec {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let version = self.kubernetes_version.trim();
        let well_formed = version
            .split_once('.')
            .map(|(major, minor)| {
                !major.is_empty()
                    && !minor.is_empty()
                    && major.chars().all(|c| c.is_ascii_digit())
                    && minor.chars().all(|c| c.is_ascii_digit())
            })
            .unwrap_or(false);
        if !well_formed {
            return Err(ProvisionError::validation(format!(
                "kubernetes_version {version:?} must look like 1.30"
            )));
        }

        let mut names = BTreeSet::new();
        for addon in &self.addons {
            addon.validate()?;
            if !names.insert(addon.name.as_str()) {
                return Err(ProvisionError::validation(format!(
                    "add-on {} is listed twice",
                    addon.name
                )));
            }
        }
        for (principal, entry) in &self.access_entries {
            entry.validate(principal)?;
        }
        Ok(())
    }

    pub fn uses_caller_principal(&self) -> bool {
        self.access_entries.contains_key(CALLER_PRINCIPAL)
    }
}
