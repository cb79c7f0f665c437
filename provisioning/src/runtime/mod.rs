pub mod apply;
pub mod descriptor;
pub mod destroy;
pub mod provider;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod simulated;

pub use destroy::DestroyOptions;
pub use provider::{Observed, Provisioner, RemoteKey, RemoteKind, RemotePhase, ResourceRequest};
pub use report::{NodeOutcome, NodeReport, Operation, StatusReport, StepReport};
pub use retry::{retry_with_backoff, RetryConfig};
pub use scheduler::{ExecutionConfig, Executor};
pub use simulated::{CallOp, ProviderCall, SimSnapshot, SimulatedProvider};
