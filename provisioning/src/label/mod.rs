//! Naming and tagging authority.
//!
//! A [`Label`] is computed once from [`LabelInputs`] and then shared by
//! `Arc` with every resource node. It is never mutated; derived names are
//! produced as new values with [`Label::with_attributes`].

pub mod reserved;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::util::ProvisionError;

pub use reserved::{reserved_tags, verify_reserved_tags, TagRole};

pub type TagSet = BTreeMap<String, String>;

fn default_delimiter() -> String {
    "-".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelInputs {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub tags: TagSet,
}

impl Default for LabelInputs {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            name: String::new(),
            stage: String::new(),
            delimiter: default_delimiter(),
            attributes: Vec::new(),
            tags: TagSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Label {
    id: String,
    namespace: String,
    name: String,
    stage: String,
    delimiter: String,
    attributes: Vec<String>,
    tags: TagSet,
}

fn disallowed_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("[^a-zA-Z0-9-]").expect("static pattern"))
}

fn normalize(part: &str) -> String {
    disallowed_chars().replace_all(part, "").to_lowercase()
}

impl Label {
    pub fn new(inputs: &LabelInputs) -> Result<Self, ProvisionError> {
        let name = normalize(&inputs.name);
        if name.is_empty() {
            return Err(ProvisionError::validation("label name must not be empty"));
        }
        let delimiter = if inputs.delimiter.is_empty() {
            default_delimiter()
        } else {
            inputs.delimiter.clone()
        };

        let mut label = Label {
            id: String::new(),
            namespace: normalize(&inputs.namespace),
            name,
            stage: normalize(&inputs.stage),
            delimiter,
            attributes: inputs
                .attributes
                .iter()
                .map(|a| normalize(a))
                .filter(|a| !a.is_empty())
                .collect(),
            tags: TagSet::new(),
        };
        label.id = label.compose_id();
        label.tags = label.generated_tags();
        // Caller-supplied tags win over generated ones.
        for (key, value) in &inputs.tags {
            label.tags.insert(key.clone(), value.clone());
        }
        Ok(label)
    }

    fn compose_id(&self) -> String {
        [&self.namespace, &self.name, &self.stage]
            .into_iter()
            .chain(self.attributes.iter())
            .filter(|part| !part.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(&self.delimiter)
    }

    fn generated_tags(&self) -> TagSet {
        let mut tags = TagSet::new();
        tags.insert("Name".into(), self.id.clone());
        if !self.namespace.is_empty() {
            tags.insert("Namespace".into(), self.namespace.clone());
        }
        if !self.stage.is_empty() {
            tags.insert("Stage".into(), self.stage.clone());
        }
        tags
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Derive a child label, e.g. `eg-eks-test` + `["cluster"]` gives
    /// `eg-eks-test-cluster`. Only the `Name` tag changes.
    pub fn with_attributes(&self, attributes: &[&str]) -> Label {
        let mut child = self.clone();
        child.attributes.extend(
            attributes
                .iter()
                .map(|a| normalize(a))
                .filter(|a| !a.is_empty()),
        );
        child.id = child.compose_id();
        child.tags.insert("Name".into(), child.id.clone());
        child
    }

    /// Label tags plus `extra`, with `extra` taking precedence.
    pub fn tags_with(&self, extra: TagSet) -> TagSet {
        let mut tags = self.tags.clone();
        tags.extend(extra);
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> LabelInputs {
        LabelInputs {
            namespace: "eg".into(),
            name: "eks".into(),
            stage: "test".into(),
            tags: TagSet::from([("Team".to_string(), "platform".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn test_compound_identifier() {
        let label = Label::new(&inputs()).unwrap();
        assert_eq!(label.id(), "eg-eks-test");
        assert_eq!(label.tags()["Name"], "eg-eks-test");
        assert_eq!(label.tags()["Namespace"], "eg");
        assert_eq!(label.tags()["Stage"], "test");
        assert_eq!(label.tags()["Team"], "platform");
    }

    #[test]
    fn test_same_inputs_same_label() {
        let first = Label::new(&inputs()).unwrap();
        for _ in 0..10 {
            let again = Label::new(&inputs()).unwrap();
            assert_eq!(again, first);
            assert_eq!(again.tags(), first.tags());
        }
    }

    #[test]
    fn test_parts_are_sanitized_and_empty_parts_dropped() {
        let label = Label::new(&LabelInputs {
            namespace: "E.G".into(),
            name: "My_Cluster".into(),
            stage: String::new(),
            delimiter: "_".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(label.id(), "eg_mycluster");
        assert!(!label.tags().contains_key("Stage"));
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let result = Label::new(&LabelInputs {
            name: "***".into(),
            ..Default::default()
        });
        assert!(matches!(result, Err(ProvisionError::Validation(_))));
    }

    #[test]
    fn test_user_tags_override_generated() {
        let mut raw = inputs();
        raw.tags.insert("Name".into(), "custom".into());
        let label = Label::new(&raw).unwrap();
        assert_eq!(label.tags()["Name"], "custom");
        assert_eq!(label.id(), "eg-eks-test");
    }

    #[test]
    fn test_child_label_leaves_parent_untouched() {
        let parent = Label::new(&inputs()).unwrap();
        let child = parent.with_attributes(&["cluster"]);
        assert_eq!(child.id(), "eg-eks-test-cluster");
        assert_eq!(child.tags()["Name"], "eg-eks-test-cluster");
        assert_eq!(parent.id(), "eg-eks-test");
        assert_eq!(parent.tags()["Name"], "eg-eks-test");
    }
}
