use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::identity::IdentityResolver;
use crate::ir::{DependencyOutputs, EdgeKind, ResourceGraph, ResourceId, ResourceNode, ResourceOutputs};
use crate::util::ProvisionError;

use super::apply::{apply_node, NodeRun};
use super::destroy::{destroy_node, DestroyOptions};
use super::provider::Provisioner;
use super::report::{NodeOutcome, NodeReport, Operation, StatusReport};
use super::retry::RetryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Nodes in flight at once.
    pub concurrency: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub poll_interval: Duration,
    /// Longest wait for a single create, update or delete to settle.
    #[serde(with = "crate::config::duration_ms")]
    pub operation_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30 * 60),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Walks a [`ResourceGraph`] against a provider.
pub struct Executor {
    provider: Arc<dyn Provisioner>,
    identity: Arc<dyn IdentityResolver>,
    config: ExecutionConfig,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        provider: Arc<dyn Provisioner>,
        identity: Arc<dyn IdentityResolver>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            provider,
            identity,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling stops submission of nodes that have not started. Nodes
    /// already talking to the provider run until they settle.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn apply(&self, graph: &ResourceGraph) -> StatusReport {
        self.apply_run(Uuid::new_v4(), graph).await
    }

    /// Apply under a run id the caller has already recorded.
    pub async fn apply_run(&self, run_id: Uuid, graph: &ResourceGraph) -> StatusReport {
        self.walk(run_id, graph, Operation::Apply, DestroyOptions::default())
            .await
    }

    /// Reverse walk: a node is deleted only after all of its dependents are.
    pub async fn destroy(&self, graph: &ResourceGraph, options: DestroyOptions) -> StatusReport {
        self.destroy_run(Uuid::new_v4(), graph, options).await
    }

    pub async fn destroy_run(
        &self,
        run_id: Uuid,
        graph: &ResourceGraph,
        options: DestroyOptions,
    ) -> StatusReport {
        self.walk(run_id, graph, Operation::Destroy, options).await
    }

    async fn walk(
        &self,
        run_id: Uuid,
        graph: &ResourceGraph,
        op: Operation,
        options: DestroyOptions,
    ) -> StatusReport {
        let started_at = Utc::now();
        let stack = graph
            .nodes()
            .next()
            .map(|n| n.label.id().to_string())
            .unwrap_or_default();
        info!(run = %run_id, %stack, operation = ?op, nodes = graph.len(), "starting execution");

        // Child token so a fatal error halts this run only.
        let run_token = self.cancel.child_token();
        let mut order = graph.topological_order();
        if op == Operation::Destroy {
            order.reverse();
        }
        let upstream = |id: &ResourceId| match op {
            Operation::Apply => graph.prerequisites(id),
            Operation::Destroy => graph.dependents(id),
        };

        let mut status: BTreeMap<ResourceId, Status> =
            order.iter().map(|id| (id.clone(), Status::Waiting)).collect();
        let mut reports: BTreeMap<ResourceId, NodeReport> = BTreeMap::new();
        let mut outputs: BTreeMap<ResourceId, ResourceOutputs> = BTreeMap::new();
        let mut fatal: Option<String> = None;
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks: JoinSet<NodeReport> = JoinSet::new();

        loop {
            if !run_token.is_cancelled() {
                for id in &order {
                    if status.get(id) != Some(&Status::Waiting) {
                        continue;
                    }
                    let prerequisites = upstream(id);
                    let ready = prerequisites
                        .iter()
                        .all(|(p, _)| status.get(p) == Some(&Status::Succeeded));
                    if !ready {
                        continue;
                    }
                    let Some(node) = graph.node(id) else { continue };

                    let mut deps = DependencyOutputs::new(id.clone());
                    if op == Operation::Apply {
                        for (p, kind) in &prerequisites {
                            if *kind == EdgeKind::Data {
                                if let Some(o) = outputs.get(p) {
                                    deps.insert(p.clone(), o.clone());
                                }
                            }
                        }
                    }

                    info!(node = %id, kind = %node.kind(), "submitting");
                    status.insert(id.clone(), Status::Running);
                    let task = NodeTask {
                        node: node.clone(),
                        deps,
                        provider: self.provider.clone(),
                        identity: self.identity.clone(),
                        config: self.config.clone(),
                        token: run_token.clone(),
                        semaphore: semaphore.clone(),
                    };
                    tasks.spawn(task.run(op, options));
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "resource task aborted");
                    continue;
                }
            };

            let id = report.id.clone();
            let settled = match &report.outcome {
                NodeOutcome::Failed { error } => {
                    warn!(node = %id, %error, "resource failed");
                    let reason = match op {
                        Operation::Apply => format!("dependency {id} failed"),
                        Operation::Destroy => format!("dependent {id} was not destroyed"),
                    };
                    let downstream = match op {
                        Operation::Apply => graph.transitive_dependents(&id),
                        Operation::Destroy => graph.transitive_prerequisites(&id),
                    };
                    for other in downstream {
                        if status.get(&other) == Some(&Status::Waiting) {
                            status.insert(other.clone(), Status::Skipped);
                            if let Some(node) = graph.node(&other) {
                                reports.insert(other.clone(), skipped(node, reason.clone()));
                            }
                        }
                    }
                    if let ProvisionError::Fatal(message) = error {
                        error!(node = %id, %message, "fatal error, halting remaining graph");
                        fatal.get_or_insert_with(|| message.clone());
                        run_token.cancel();
                    }
                    Status::Failed
                }
                NodeOutcome::Skipped { .. } => Status::Skipped,
                _ => {
                    if let Some(o) = &report.outputs {
                        outputs.insert(id.clone(), o.clone());
                    }
                    Status::Succeeded
                }
            };
            info!(node = %id, outcome = ?settled, "settled");
            status.insert(id.clone(), settled);
            reports.insert(id, report);
        }

        let cancelled = self.cancel.is_cancelled();
        for id in &order {
            let Some(node) = graph.node(id) else { continue };
            match status.get(id) {
                Some(Status::Waiting) => {
                    let reason = if let Some(message) = &fatal {
                        format!("halted by fatal error: {message}")
                    } else if cancelled {
                        "cancelled before submission".to_string()
                    } else {
                        "dependency not ready".to_string()
                    };
                    reports.insert(id.clone(), skipped(node, reason));
                }
                Some(Status::Running) => {
                    reports.insert(
                        id.clone(),
                        failed(
                            node,
                            ProvisionError::ResourceFailed {
                                resource: node.remote_name.clone(),
                                reason: "executor task aborted".into(),
                            },
                        ),
                    );
                }
                _ => {}
            }
        }

        let nodes = order.iter().filter_map(|id| reports.remove(id)).collect();
        let report = StatusReport {
            run_id,
            operation: op,
            stack,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            fatal,
            nodes,
        };
        info!(run = %run_id, succeeded = report.succeeded(), "execution finished");
        report
    }
}

fn skipped(node: &ResourceNode, reason: String) -> NodeReport {
    NodeReport::skipped(node.id.clone(), node.kind(), node.remote_name.clone(), reason)
}

fn failed(node: &ResourceNode, error: ProvisionError) -> NodeReport {
    let mut report = skipped(node, String::new());
    report.outcome = NodeOutcome::Failed { error };
    report
}

struct NodeTask {
    node: ResourceNode,
    deps: DependencyOutputs,
    provider: Arc<dyn Provisioner>,
    identity: Arc<dyn IdentityResolver>,
    config: ExecutionConfig,
    token: CancellationToken,
    semaphore: Arc<Semaphore>,
}

impl NodeTask {
    async fn run(self, op: Operation, options: DestroyOptions) -> NodeReport {
        let Ok(_permit) = self.semaphore.clone().acquire_owned().await else {
            return skipped(&self.node, "executor shut down".into());
        };
        // Submitted but still queued behind the permit limit.
        if self.token.is_cancelled() {
            return skipped(&self.node, "cancelled before start".into());
        }

        let started_at = Utc::now();
        let run: NodeRun = match op {
            Operation::Apply => {
                apply_node(
                    &self.node,
                    &self.deps,
                    self.provider.as_ref(),
                    &self.identity,
                    &self.config,
                )
                .await
            }
            Operation::Destroy => {
                destroy_node(&self.node, self.provider.as_ref(), &self.config, options).await
            }
        };

        NodeReport {
            id: self.node.id.clone(),
            kind: self.node.kind(),
            remote_name: self.node.remote_name.clone(),
            outcome: run.outcome,
            state: run.lifecycle.state(),
            history: run.lifecycle.history().to_vec(),
            attempts: run.attempts,
            steps: run.steps,
            outputs: run.outputs,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }
}
