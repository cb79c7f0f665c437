pub mod api;
pub mod cluster;
pub mod config;
pub mod identity;
pub mod ir;
pub mod label;
pub mod meta;
pub mod network;
pub mod nodegroup;
pub mod persistence;
pub mod planner;
pub mod runtime;
pub mod util;

pub use api::{handle_apply, handle_destroy, handle_plan, PlanSummary, StackOutputs};
pub use config::{Config, ConfigError};
pub use ir::{ResourceGraph, ResourceId, ResourceKind, ResourceState};
pub use meta::{load_from_path, StackDocument};
pub use planner::{compile_stack, CompileOutputs};
pub use runtime::{DestroyOptions, ExecutionConfig, Executor, StatusReport};
pub use util::ProvisionError;
