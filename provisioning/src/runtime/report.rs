use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use uuid::Uuid;

use crate::ir::{ResourceId, ResourceKind, ResourceOutputs, ResourceState};
use crate::util::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    Created,
    Updated,
    /// Replaced an object the provider reported as failed.
    Recreated,
    Unchanged,
    Deleted,
    AlreadyAbsent,
    Failed { error: ProvisionError },
    Skipped { reason: String },
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, NodeOutcome::Failed { .. } | NodeOutcome::Skipped { .. })
    }

    pub fn error(&self) -> Option<&ProvisionError> {
        match self {
            NodeOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }

    fn summary(&self) -> String {
        match self {
            NodeOutcome::Created => "created".into(),
            NodeOutcome::Updated => "updated".into(),
            NodeOutcome::Recreated => "recreated".into(),
            NodeOutcome::Unchanged => "unchanged".into(),
            NodeOutcome::Deleted => "deleted".into(),
            NodeOutcome::AlreadyAbsent => "already absent".into(),
            NodeOutcome::Failed { error } => format!("FAILED: {error}"),
            NodeOutcome::Skipped { reason } => format!("skipped: {reason}"),
        }
    }
}

/// One step of a multi-step node, such as a single add-on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub outcome: NodeOutcome,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub remote_name: String,
    pub outcome: NodeOutcome,
    pub state: ResourceState,
    pub history: Vec<ResourceState>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<ResourceOutputs>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeReport {
    pub fn skipped(id: ResourceId, kind: ResourceKind, remote_name: String, reason: String) -> Self {
        Self {
            id,
            kind,
            remote_name,
            outcome: NodeOutcome::Skipped { reason },
            state: ResourceState::Absent,
            history: Vec::new(),
            attempts: 0,
            steps: Vec::new(),
            outputs: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Per-node result of one apply or destroy run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub run_id: Uuid,
    pub operation: Operation,
    pub stack: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub fatal: Option<String>,
    /// In walk order.
    pub nodes: Vec<NodeReport>,
}

impl StatusReport {
    pub fn succeeded(&self) -> bool {
        self.fatal.is_none() && !self.cancelled && self.nodes.iter().all(|n| n.outcome.is_success())
    }

    pub fn node(&self, id: &ResourceId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.outcome, NodeOutcome::Failed { .. }))
    }

    pub fn outputs(&self) -> BTreeMap<ResourceId, ResourceOutputs> {
        self.nodes
            .iter()
            .filter_map(|n| n.outputs.clone().map(|o| (n.id.clone(), o)))
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:?} {} ({}){}",
            self.operation,
            self.stack,
            self.run_id,
            if self.cancelled { " [cancelled]" } else { "" }
        );
        if let Some(fatal) = &self.fatal {
            let _ = writeln!(out, "  halted: {fatal}");
        }
        for node in &self.nodes {
            let _ = writeln!(
                out,
                "  {:<32} {:<12} {:<9} {}",
                node.id.as_str(),
                node.kind.to_string(),
                node.state.to_string(),
                node.outcome.summary()
            );
            for step in &node.steps {
                let _ = writeln!(out, "    - {:<38} {}", step.name, step.outcome.summary());
            }
        }
        out
    }
}
