use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::info;
use uuid::Uuid;

use crate::ir::{
    AccessEntryOutputs, AddonOutputs, ClusterOutputs, Dependency, NodeGroupOutputs, ResourceKind,
    ResourceOutputs,
};
use crate::label::TagSet;
use crate::meta::StackDocument;
use crate::persistence::StateRepository;
use crate::planner::{compile_stack, CompileOutputs};
use crate::runtime::{DestroyOptions, Executor, NodeOutcome, Operation, StatusReport};
use crate::util::ProvisionError;

/// Compile a stack and print its graph; no provider calls.
#[derive(Debug, Clone)]
pub struct PlanStack {
    pub stack: StackDocument,
}

#[derive(Debug, Clone)]
pub struct ApplyStack {
    pub stack: StackDocument,
}

#[derive(Debug, Clone)]
pub struct DestroyStack {
    pub stack: StackDocument,
    pub options: DestroyOptions,
}

/// One line of the per-stack `events.jsonl` log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProvisioningEvent {
    PlanCompiled { stack: String, nodes: Vec<String> },
    RunStarted { run_id: Uuid, operation: Operation },
    NodeSettled { run_id: Uuid, node: String, outcome: NodeOutcome },
    RunFinished { run_id: Uuid, succeeded: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub at: DateTime<Utc>,
    pub event: ProvisioningEvent,
}

impl RecordedEvent {
    pub fn now(event: ProvisioningEvent) -> Self {
        Self { at: Utc::now(), event }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub kind: ResourceKind,
    pub remote_name: String,
    pub depends_on: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub stack: String,
    pub cluster_name: String,
    pub region: String,
    /// Topological order.
    pub steps: Vec<PlanStep>,
}

impl PlanSummary {
    fn from_compiled(compiled: &CompileOutputs) -> Self {
        Self {
            stack: compiled.label.id().to_string(),
            cluster_name: compiled.cluster_name.clone(),
            region: compiled.region.clone(),
            steps: compiled
                .graph
                .nodes()
                .map(|n| PlanStep {
                    id: n.id.to_string(),
                    kind: n.kind(),
                    remote_name: n.remote_name.clone(),
                    depends_on: n.depends_on.clone(),
                })
                .collect(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "stack {} ({}), cluster {}", self.stack, self.region, self.cluster_name);
        for (i, step) in self.steps.iter().enumerate() {
            let deps: Vec<String> = step
                .depends_on
                .iter()
                .map(|d| format!("{}({})", d.id, d.kind))
                .collect();
            let _ = writeln!(
                out,
                "{:>3}. {:<32} {:<12} {:<36} <- {}",
                i + 1,
                step.id,
                step.kind.to_string(),
                step.remote_name,
                if deps.is_empty() { "-".to_string() } else { deps.join(", ") }
            );
        }
        out
    }
}

/// Operator-facing outputs of a stack. Subnet ids keep input zone order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackOutputs {
    pub stack: String,
    pub region: String,
    pub network_id: Option<String>,
    pub internet_gateway_id: Option<String>,
    pub cidr_block: Option<String>,
    pub public_subnet_ids: Vec<String>,
    pub private_subnet_ids: Vec<String>,
    pub nat_gateway_ids: Vec<String>,
    pub cluster: Option<ClusterOutputs>,
    pub node_groups: BTreeMap<String, NodeGroupOutputs>,
    pub addons: Vec<AddonOutputs>,
    pub access_entries: Vec<AccessEntryOutputs>,
    pub tags: TagSet,
}

impl StackOutputs {
    pub fn from_report(report: &StatusReport, compiled: &CompileOutputs) -> Self {
        let mut out = StackOutputs {
            stack: compiled.label.id().to_string(),
            region: compiled.region.clone(),
            tags: compiled.label.tags().clone(),
            ..Default::default()
        };
        for (id, outputs) in report.outputs() {
            match outputs {
                ResourceOutputs::Network(n) => {
                    out.network_id = Some(n.network_id);
                    out.internet_gateway_id = Some(n.internet_gateway_id);
                    out.cidr_block = Some(n.cidr_block);
                }
                ResourceOutputs::Subnets(s) => {
                    out.public_subnet_ids = s.public_subnet_ids;
                    out.private_subnet_ids = s.private_subnet_ids;
                    out.nat_gateway_ids = s.nat_gateway_ids;
                }
                ResourceOutputs::Cluster(c) => out.cluster = Some(c),
                ResourceOutputs::NodeGroup(g) => {
                    out.node_groups.insert(id.to_string(), g);
                }
                ResourceOutputs::Addons(a) => out.addons.extend(a.installed),
                ResourceOutputs::AccessEntry(e) => out.access_entries.push(e),
                _ => {}
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub report: StatusReport,
    pub outputs: StackOutputs,
}

/// Compile only. Validation errors come back before anything is touched.
pub fn handle_plan(cmd: &PlanStack) -> Result<PlanSummary, ProvisionError> {
    let compiled = compile_stack(&cmd.stack)?;
    Ok(PlanSummary::from_compiled(&compiled))
}

async fn record_run(repo: &StateRepository, report: &StatusReport) -> Result<()> {
    for node in &report.nodes {
        repo.record(ProvisioningEvent::NodeSettled {
            run_id: report.run_id,
            node: node.id.to_string(),
            outcome: node.outcome.clone(),
        })
        .await?;
    }
    repo.record(ProvisioningEvent::RunFinished {
        run_id: report.run_id,
        succeeded: report.succeeded(),
    })
    .await?;
    repo.save_report(report).await
}

/// Validation errors surface here, before the executor makes any call.
pub async fn handle_apply(
    cmd: &ApplyStack,
    executor: &Executor,
    repo: &StateRepository,
) -> Result<RunResult> {
    let compiled = compile_stack(&cmd.stack)?;
    repo.record(ProvisioningEvent::PlanCompiled {
        stack: compiled.label.id().to_string(),
        nodes: compiled.graph.topological_order().iter().map(|id| id.to_string()).collect(),
    })
    .await?;

    let run_id = Uuid::new_v4();
    repo.record(ProvisioningEvent::RunStarted {
        run_id,
        operation: Operation::Apply,
    })
    .await?;
    let report = executor.apply_run(run_id, &compiled.graph).await;
    record_run(repo, &report).await?;

    let outputs = StackOutputs::from_report(&report, &compiled);
    repo.save_outputs(&outputs).await?;
    info!(stack = %outputs.stack, succeeded = report.succeeded(), "apply finished");
    Ok(RunResult { report, outputs })
}

pub async fn handle_destroy(
    cmd: &DestroyStack,
    executor: &Executor,
    repo: &StateRepository,
) -> Result<StatusReport> {
    let compiled = compile_stack(&cmd.stack)?;
    let run_id = Uuid::new_v4();
    repo.record(ProvisioningEvent::RunStarted {
        run_id,
        operation: Operation::Destroy,
    })
    .await?;
    let report = executor.destroy_run(run_id, &compiled.graph, cmd.options).await;
    record_run(repo, &report).await?;
    if report.succeeded() {
        repo.clear_outputs().await?;
    }
    info!(stack = %report.stack, succeeded = report.succeeded(), "destroy finished");
    Ok(report)
}
