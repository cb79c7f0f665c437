//! Teardown of a single node. Deletes are retried only when the operator
//! confirmed it.

use tracing::{info, warn};

use crate::ir::{Lifecycle, ResourceKind, ResourceNode, ResourceState};
use crate::util::ProvisionError;

use super::apply::{Converger, NodeRun};
use super::descriptor::remote_keys;
use super::provider::{Observed, Provisioner, RemoteKey, RemotePhase};
use super::report::{NodeOutcome, StepReport};
use super::retry::{retry_with_backoff, RetryConfig};
use super::scheduler::ExecutionConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Allow transient delete failures to be retried.
    pub retry_confirmed: bool,
}

impl<'a> Converger<'a> {
    async fn delete_and_wait(&self, key: &RemoteKey) -> Result<(), ProvisionError> {
        self.provider.delete(key).await?;
        match self.wait_settled(key).await? {
            None => Ok(()),
            Some(Observed {
                phase: RemotePhase::Failed { reason },
                ..
            }) => Err(ProvisionError::ResourceFailed {
                resource: key.to_string(),
                reason,
            }),
            Some(_) => Err(ProvisionError::ExternalService(format!(
                "{key} still exists after delete"
            ))),
        }
    }

    pub(crate) async fn teardown(
        &self,
        key: &RemoteKey,
        options: DestroyOptions,
        lifecycle: &mut Lifecycle,
        attempts: &mut u32,
    ) -> Result<NodeOutcome, ProvisionError> {
        let observed = match self.read(key).await? {
            Some(o) if o.phase == RemotePhase::Pending => self.wait_settled(key).await?,
            other => other,
        };
        let Some(observed) = observed else {
            return Ok(NodeOutcome::AlreadyAbsent);
        };
        lifecycle.observe(match observed.phase {
            RemotePhase::Failed { .. } => ResourceState::Error,
            _ => ResourceState::Ready,
        });
        lifecycle.transition(ResourceState::Deleting)?;
        info!(resource = %key, "deleting");

        let policy = if options.retry_confirmed {
            self.config.retry.clone()
        } else {
            RetryConfig::no_retry()
        };
        let outcome = retry_with_backoff(
            &policy,
            &format!("delete {key}"),
            ProvisionError::is_retryable,
            || self.delete_and_wait(key),
        )
        .await;
        *attempts += outcome.attempts;
        match outcome.result {
            Ok(()) => {
                lifecycle.transition(ResourceState::Absent)?;
                Ok(NodeOutcome::Deleted)
            }
            Err(e) => {
                lifecycle.transition(ResourceState::Error)?;
                Err(e)
            }
        }
    }
}

pub(crate) async fn destroy_node(
    node: &ResourceNode,
    provider: &dyn Provisioner,
    config: &ExecutionConfig,
    options: DestroyOptions,
) -> NodeRun {
    let converger = Converger { provider, config };
    let mut run = NodeRun::new(node);
    let keys = remote_keys(node);
    if keys.is_empty() {
        return run;
    }
    let multi_step = keys.len() > 1 || node.kind() == ResourceKind::Addons;

    let mut first_error = None;
    let mut deleted_any = false;
    for key in keys {
        let mut lifecycle = Lifecycle::new(node.id.clone());
        let mut attempts = 0;
        let result = converger
            .teardown(&key, options, &mut lifecycle, &mut attempts)
            .await;
        run.attempts += attempts;
        if !multi_step {
            run.lifecycle = lifecycle;
        }
        let outcome = match result {
            Ok(outcome) => {
                deleted_any |= outcome == NodeOutcome::Deleted;
                outcome
            }
            Err(error) => {
                warn!(node = %node.id, resource = %key, %error, "delete failed");
                first_error.get_or_insert_with(|| error.clone());
                NodeOutcome::Failed { error }
            }
        };
        if multi_step {
            run.steps.push(StepReport {
                name: key.name.clone(),
                outcome,
                attempts,
            });
        }
    }

    if let Some(error) = first_error {
        if multi_step {
            run.lifecycle.observe(ResourceState::Error);
        }
        return run.fail(error);
    }
    run.outcome = if deleted_any {
        NodeOutcome::Deleted
    } else {
        NodeOutcome::AlreadyAbsent
    };
    run
}
