//! Converging one node towards its declared configuration.

use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::identity::{resolve_identity, IdentityResolver};
use crate::ir::{
    AddonsOutputs, DependencyOutputs, IdentityOutputs, LabelOutputs, Lifecycle, NodeConfig,
    ResourceKind, ResourceNode, ResourceOutputs, ResourceState,
};
use crate::util::ProvisionError;

use super::descriptor::{addon_requests, build_request};
use super::provider::{is_converged, Observed, Provisioner, RemoteKey, RemotePhase, ResourceRequest};
use super::report::{NodeOutcome, StepReport};
use super::retry::{retry_with_backoff, RetryConfig};
use super::scheduler::ExecutionConfig;

/// What a node run hands back to the scheduler.
pub(crate) struct NodeRun {
    pub outcome: NodeOutcome,
    pub lifecycle: Lifecycle,
    pub attempts: u32,
    pub steps: Vec<StepReport>,
    pub outputs: Option<ResourceOutputs>,
}

impl NodeRun {
    pub(crate) fn new(node: &ResourceNode) -> Self {
        Self {
            outcome: NodeOutcome::Unchanged,
            lifecycle: Lifecycle::new(node.id.clone()),
            attempts: 0,
            steps: Vec::new(),
            outputs: None,
        }
    }

    pub(crate) fn fail(mut self, error: ProvisionError) -> Self {
        self.outcome = NodeOutcome::Failed { error };
        self
    }
}

pub(crate) struct Converged {
    pub outcome: NodeOutcome,
    pub outputs: ResourceOutputs,
}

pub(crate) struct Converger<'a> {
    pub provider: &'a dyn Provisioner,
    pub config: &'a ExecutionConfig,
}

fn retries_failed_creation(kind: ResourceKind) -> bool {
    kind != ResourceKind::Cluster
}

impl<'a> Converger<'a> {
    pub(crate) async fn read(&self, key: &RemoteKey) -> Result<Option<Observed>, ProvisionError> {
        retry_with_backoff(
            &self.config.retry,
            &format!("read {key}"),
            ProvisionError::is_retryable,
            || self.provider.read(key),
        )
        .await
        .result
    }

    /// Poll until the object leaves `Pending`. `None` once it is gone.
    pub(crate) async fn wait_settled(&self, key: &RemoteKey) -> Result<Option<Observed>, ProvisionError> {
        // A timeout past the clock's range means no deadline.
        let deadline = Instant::now().checked_add(self.config.operation_timeout);
        loop {
            match self.read(key).await? {
                Some(observed) if observed.phase == RemotePhase::Pending => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(ProvisionError::Timeout {
                            resource: key.to_string(),
                            waited_secs: self.config.operation_timeout.as_secs(),
                        });
                    }
                    debug!(resource = %key, "waiting for resource to settle");
                    sleep(self.config.poll_interval).await;
                }
                other => return Ok(other),
            }
        }
    }

    async fn wait_ready(&self, key: &RemoteKey) -> Result<ResourceOutputs, ProvisionError> {
        match self.wait_settled(key).await? {
            Some(Observed {
                phase: RemotePhase::Ready,
                outputs: Some(outputs),
                ..
            }) => Ok(outputs),
            Some(Observed {
                phase: RemotePhase::Failed { reason },
                ..
            }) => Err(ProvisionError::ResourceFailed {
                resource: key.to_string(),
                reason,
            }),
            Some(_) => Err(ProvisionError::ExternalService(format!(
                "{key} is ready but reported no outputs"
            ))),
            None => Err(ProvisionError::NotFound(key.to_string())),
        }
    }

    async fn create_and_wait(&self, request: &ResourceRequest) -> Result<ResourceOutputs, ProvisionError> {
        self.provider.create(request).await?;
        self.wait_ready(&request.key()).await
    }

    async fn update_and_wait(&self, request: &ResourceRequest) -> Result<ResourceOutputs, ProvisionError> {
        self.provider.update(request).await?;
        self.wait_ready(&request.key()).await
    }

    async fn create(
        &self,
        kind: ResourceKind,
        request: &ResourceRequest,
        attempts: &mut u32,
    ) -> Result<ResourceOutputs, ProvisionError> {
        let retry_failed = retries_failed_creation(kind);
        let outcome = retry_with_backoff(
            &self.config.retry,
            &format!("create {}", request.key()),
            |e: &ProvisionError| {
                e.is_retryable() || (retry_failed && matches!(e, ProvisionError::ResourceFailed { .. }))
            },
            || self.create_and_wait(request),
        )
        .await;
        *attempts += outcome.attempts;
        outcome.result
    }

    async fn update(
        &self,
        kind: ResourceKind,
        request: &ResourceRequest,
        attempts: &mut u32,
    ) -> Result<ResourceOutputs, ProvisionError> {
        // Resizing a pool is not idempotent from the scheduler's point of view.
        let policy = if kind == ResourceKind::NodeGroup {
            RetryConfig::no_retry()
        } else {
            self.config.retry.clone()
        };
        let outcome = retry_with_backoff(
            &policy,
            &format!("update {}", request.key()),
            ProvisionError::is_retryable,
            || self.update_and_wait(request),
        )
        .await;
        *attempts += outcome.attempts;
        outcome.result
    }

    /// Read, then create, recreate, update or leave alone.
    pub(crate) async fn converge(
        &self,
        kind: ResourceKind,
        request: &ResourceRequest,
        lifecycle: &mut Lifecycle,
        attempts: &mut u32,
    ) -> Result<Converged, ProvisionError> {
        let key = request.key();
        let observed = match self.read(&key).await? {
            Some(observed) if observed.phase == RemotePhase::Pending => {
                lifecycle.observe(ResourceState::Creating);
                self.wait_settled(&key).await?
            }
            other => other,
        };

        let (outcome, result) = match observed {
            None => {
                lifecycle.observe(ResourceState::Absent);
                lifecycle.transition(ResourceState::Creating)?;
                info!(resource = %key, "creating");
                (NodeOutcome::Created, self.create(kind, request, attempts).await)
            }
            Some(Observed {
                phase: RemotePhase::Failed { reason },
                ..
            }) => {
                lifecycle.observe(ResourceState::Error);
                lifecycle.transition(ResourceState::Creating)?;
                warn!(resource = %key, %reason, "replacing failed resource");
                (NodeOutcome::Recreated, self.create(kind, request, attempts).await)
            }
            Some(observed) => {
                lifecycle.observe(ResourceState::Ready);
                if is_converged(request, &observed.applied) {
                    let outputs = observed.outputs.ok_or_else(|| {
                        ProvisionError::ExternalService(format!("{key} is ready but reported no outputs"))
                    })?;
                    debug!(resource = %key, "already converged");
                    return Ok(Converged {
                        outcome: NodeOutcome::Unchanged,
                        outputs,
                    });
                }
                lifecycle.transition(ResourceState::Updating)?;
                info!(resource = %key, "updating");
                (NodeOutcome::Updated, self.update(kind, request, attempts).await)
            }
        };

        match result {
            Ok(outputs) => {
                lifecycle.transition(ResourceState::Ready)?;
                Ok(Converged { outcome, outputs })
            }
            Err(error) => {
                lifecycle.transition(ResourceState::Error)?;
                Err(error)
            }
        }
    }
}

pub(crate) async fn apply_node(
    node: &ResourceNode,
    deps: &DependencyOutputs,
    provider: &dyn Provisioner,
    identity: &Arc<dyn IdentityResolver>,
    config: &ExecutionConfig,
) -> NodeRun {
    let converger = Converger { provider, config };
    let mut run = NodeRun::new(node);

    match &node.config {
        NodeConfig::Label { cluster_name } => {
            run.lifecycle.observe(ResourceState::Ready);
            run.outputs = Some(ResourceOutputs::Label(LabelOutputs {
                id: node.label.id().to_string(),
                cluster_name: cluster_name.clone(),
                tags: node.label.tags().clone(),
            }));
            run
        }
        NodeConfig::Identity => {
            let outcome = retry_with_backoff(
                &config.retry,
                "resolve caller identity",
                ProvisionError::is_retryable,
                || resolve_identity(identity.as_ref()),
            )
            .await;
            run.attempts = outcome.attempts;
            match outcome.result {
                Ok(resolved) => {
                    run.lifecycle.observe(ResourceState::Ready);
                    info!(principal = %resolved.principal_arn, "resolved caller identity");
                    run.outputs = Some(ResourceOutputs::Identity(IdentityOutputs {
                        account: resolved.caller.account,
                        caller_arn: resolved.caller.arn,
                        principal_arn: resolved.principal_arn,
                    }));
                    run
                }
                Err(e) => run.fail(e),
            }
        }
        NodeConfig::Addons { .. } => install_addons(node, deps, &converger, run).await,
        _ => {
            let request = match build_request(node, deps) {
                Ok(request) => request,
                Err(e) => return run.fail(e),
            };
            let kind = node.kind();
            let result = converger
                .converge(kind, &request, &mut run.lifecycle, &mut run.attempts)
                .await;
            match result {
                Ok(converged) => {
                    run.outcome = converged.outcome;
                    run.outputs = Some(converged.outputs);
                    run
                }
                // Nothing that hangs off a broken control plane can proceed.
                Err(e) if kind == ResourceKind::Cluster => {
                    run.fail(ProvisionError::Fatal(format!("control plane {}: {e}", node.remote_name)))
                }
                Err(e) => run.fail(e),
            }
        }
    }
}

/// Add-ons go in strictly in list order. A failure is isolated to its own
/// add-on unless it is a conflict under an abort policy, which stops the
/// rest of the list without rolling back what is already installed.
async fn install_addons(
    node: &ResourceNode,
    deps: &DependencyOutputs,
    converger: &Converger<'_>,
    mut run: NodeRun,
) -> NodeRun {
    let requests = match addon_requests(node, deps) {
        Ok(requests) => requests,
        Err(e) => return run.fail(e),
    };

    let mut installed = Vec::new();
    let mut first_error: Option<ProvisionError> = None;
    let mut aborted_by: Option<String> = None;
    let mut changed = false;
    let mut created = false;

    for addon in requests {
        let name = addon.addon.name.clone();
        if let Some(blocker) = &aborted_by {
            run.steps.push(StepReport {
                name,
                outcome: NodeOutcome::Skipped {
                    reason: format!("aborted after conflict on {blocker}"),
                },
                attempts: 0,
            });
            continue;
        }

        let request = ResourceRequest::Addon(addon);
        let mut lifecycle = Lifecycle::new(node.id.clone());
        let mut attempts = 0;
        let result = converger
            .converge(ResourceKind::Addons, &request, &mut lifecycle, &mut attempts)
            .await;
        run.attempts += attempts;
        match result {
            Ok(converged) => {
                changed |= converged.outcome != NodeOutcome::Unchanged;
                created |= matches!(converged.outcome, NodeOutcome::Created | NodeOutcome::Recreated);
                if let ResourceOutputs::Addon(outputs) = &converged.outputs {
                    installed.push(outputs.clone());
                }
                run.steps.push(StepReport {
                    name,
                    outcome: converged.outcome,
                    attempts,
                });
            }
            Err(error) => {
                warn!(node = %node.id, addon = %name, %error, "add-on failed");
                if matches!(error, ProvisionError::ConflictOnUpdate { .. }) {
                    aborted_by = Some(name.clone());
                }
                first_error.get_or_insert_with(|| error.clone());
                run.steps.push(StepReport {
                    name,
                    outcome: NodeOutcome::Failed { error },
                    attempts,
                });
            }
        }
    }

    run.outputs = Some(ResourceOutputs::Addons(AddonsOutputs { installed }));
    if first_error.is_none() && !changed {
        run.lifecycle.observe(ResourceState::Ready);
        return run;
    }
    let existed = run
        .steps
        .iter()
        .any(|s| matches!(s.outcome, NodeOutcome::Unchanged | NodeOutcome::Updated));
    let failed = first_error.is_some();
    if let Err(e) = settle_addons_lifecycle(&mut run.lifecycle, !created && existed, failed) {
        return run.fail(e);
    }
    match first_error {
        Some(error) => run.fail(error),
        None => {
            run.outcome = if created {
                NodeOutcome::Created
            } else {
                NodeOutcome::Updated
            };
            run
        }
    }
}

/// The add-on list as one node: created when any add-on was new, otherwise
/// updated in place.
fn settle_addons_lifecycle(
    lifecycle: &mut Lifecycle,
    existed: bool,
    failed: bool,
) -> Result<(), ProvisionError> {
    if existed {
        lifecycle.observe(ResourceState::Ready);
        lifecycle.transition(ResourceState::Updating)?;
    } else {
        lifecycle.transition(ResourceState::Creating)?;
    }
    lifecycle.transition(if failed {
        ResourceState::Error
    } else {
        ResourceState::Ready
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ResourceId;

    #[test]
    fn test_addons_lifecycle_paths() {
        let mut fresh = Lifecycle::new(ResourceId::from("eks/addons"));
        settle_addons_lifecycle(&mut fresh, false, false).unwrap();
        assert_eq!(
            fresh.history(),
            [ResourceState::Absent, ResourceState::Creating, ResourceState::Ready]
        );

        let mut upgraded = Lifecycle::new(ResourceId::from("eks/addons"));
        settle_addons_lifecycle(&mut upgraded, true, true).unwrap();
        assert_eq!(upgraded.state(), ResourceState::Error);
        assert_eq!(
            upgraded.history(),
            [
                ResourceState::Absent,
                ResourceState::Ready,
                ResourceState::Updating,
                ResourceState::Error
            ]
        );
    }

    #[test]
    fn test_addons_lifecycle_rejects_illegal_start() {
        let mut lifecycle = Lifecycle::new(ResourceId::from("eks/addons"));
        lifecycle.observe(ResourceState::Deleting);
        let err = settle_addons_lifecycle(&mut lifecycle, false, false).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTransition { .. }));
    }
}
