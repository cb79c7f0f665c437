use serde::{Deserialize, Serialize};
use std::fmt;

use super::ResourceId;
use crate::util::ProvisionError;

/// Observed state of a node as tracked by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    #[default]
    Absent,
    Creating,
    Ready,
    Updating,
    Deleting,
    Error,
}

impl ResourceState {
    pub fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Absent, Creating)
                | (Creating, Ready)
                | (Creating, Error)
                | (Error, Creating)
                | (Ready, Updating)
                | (Updating, Ready)
                | (Updating, Error)
                | (Ready, Deleting)
                | (Error, Deleting)
                | (Deleting, Absent)
                | (Deleting, Error)
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceState::Absent => "absent",
            ResourceState::Creating => "creating",
            ResourceState::Ready => "ready",
            ResourceState::Updating => "updating",
            ResourceState::Deleting => "deleting",
            ResourceState::Error => "error",
        };
        f.write_str(name)
    }
}

/// State of one node plus the path it took during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    node: ResourceId,
    state: ResourceState,
    history: Vec<ResourceState>,
}

impl Lifecycle {
    pub fn new(node: ResourceId) -> Self {
        Self {
            node,
            state: ResourceState::Absent,
            history: vec![ResourceState::Absent],
        }
    }

    /// Seed the state from what the provider reports, without a transition.
    pub fn observe(&mut self, state: ResourceState) {
        if self.state != state {
            self.state = state;
            self.history.push(state);
        }
    }

    pub fn transition(&mut self, next: ResourceState) -> Result<(), ProvisionError> {
        if !self.state.can_transition_to(next) {
            return Err(ProvisionError::InvalidTransition {
                node: self.node.to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn history(&self) -> &[ResourceState] {
        &self.history
    }
}
