use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes raised while compiling a stack document or walking its
/// resource graph.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", content = "detail", rename_all = "snake_case")]
pub enum ProvisionError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("address block {requested} overlaps existing block {existing}")]
    AllocationConflict { requested: String, existing: String },

    #[error("no address space left in zone {zone}: {reason}")]
    CapacityExhausted { zone: String, reason: String },

    /// A node was submitted before one of its data dependencies produced
    /// outputs. Raised only by an orchestrator defect.
    #[error("dependency {dependency} of {node} is not ready")]
    DependencyNotReady { node: String, dependency: String },

    #[error("{resource} already exists with divergent configuration: {detail}")]
    ConflictOnUpdate { resource: String, detail: String },

    /// Transient failure of the provisioning or identity service.
    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("{resource} reached a failed state: {reason}")]
    ResourceFailed { resource: String, reason: String },

    #[error("{resource} did not settle within {waited_secs}s")]
    Timeout { resource: String, waited_secs: u64 },

    #[error("{0} does not exist")]
    NotFound(String),

    #[error("invalid state transition for {node}: {from} -> {to}")]
    InvalidTransition { node: String, from: String, to: String },

    /// Control-plane failure; halts every node not yet submitted.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ProvisionError {
    /// Only transient service failures are retried by default.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::ExternalService(_))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ProvisionError::Validation(message.into())
    }
}
