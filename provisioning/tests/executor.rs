mod common;

use async_trait::async_trait;
use common::*;
use provisioning::api::ApplyStack;
use provisioning::identity::IdentityResolver;
use provisioning::persistence::StateRepository;
use provisioning::runtime::{
    CallOp, NodeOutcome, Observed, ProviderCall, Provisioner, RemoteKey, RemoteKind, RemotePhase,
    ResourceRequest, SimulatedProvider,
};
use provisioning::{compile_stack, handle_apply, ProvisionError, ResourceId};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn key(kind: RemoteKind, name: &str) -> RemoteKey {
    RemoteKey::new(kind, name)
}

fn first_call(calls: &[ProviderCall], key: &RemoteKey) -> usize {
    calls
        .iter()
        .position(|c| c.key == *key)
        .unwrap_or_else(|| panic!("no call for {key}"))
}

fn first_ready_read(calls: &[ProviderCall], key: &RemoteKey) -> usize {
    calls
        .iter()
        .position(|c| c.key == *key && c.op == CallOp::Read && c.phase == Some(RemotePhase::Ready))
        .unwrap_or_else(|| panic!("{key} never read as ready"))
}

#[tokio::test]
async fn test_apply_creates_the_whole_stack() {
    let sim = Arc::new(SimulatedProvider::new());
    let compiled = compile_stack(&stack()).unwrap();
    let report = executor(&sim).apply(&compiled.graph).await;

    assert!(report.succeeded(), "{}", report.render());
    assert_eq!(report.stack, STACK);
    for id in ["vpc", "subnets", "workers", "eks", "eks/addons", "eks/access/@caller"] {
        let node = report.node(&ResourceId::from(id)).unwrap();
        assert_eq!(node.outcome, NodeOutcome::Created, "{id}");
    }
    assert!(sim.exists(&key(RemoteKind::Cluster, CLUSTER)).await);
    assert!(sim.exists(&key(RemoteKind::NodeGroup, NODE_GROUP)).await);
    assert!(sim.exists(&key(RemoteKind::AccessEntry, &format!("{CLUSTER}/@caller"))).await);
}

#[tokio::test]
async fn test_three_zone_layout_outputs() {
    let sim = Arc::new(SimulatedProvider::new());
    let dir = tempfile::tempdir().unwrap();
    let repo = StateRepository::new(dir.path(), STACK);
    let result = handle_apply(&ApplyStack { stack: stack() }, &executor(&sim), &repo)
        .await
        .unwrap();

    let outputs = result.outputs;
    assert_eq!(outputs.cidr_block.as_deref(), Some("172.16.0.0/16"));
    assert_eq!(outputs.public_subnet_ids.len(), 3);
    assert_eq!(outputs.private_subnet_ids.len(), 3);
    assert_eq!(outputs.nat_gateway_ids.len(), 3);
    let mut all: Vec<_> = outputs
        .public_subnet_ids
        .iter()
        .chain(outputs.private_subnet_ids.iter())
        .collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 6);

    let cluster = outputs.cluster.as_ref().unwrap();
    assert_eq!(cluster.cluster_name, CLUSTER);
    assert!(cluster.oidc_issuer_url.is_some());
    assert_eq!(outputs.node_groups["workers"].desired_size, 3);
    assert_eq!(outputs.addons.len(), 3);
    assert_eq!(
        outputs.access_entries[0].principal_arn,
        "arn:aws:iam::111122223333:role/platform-admin"
    );
    assert_eq!(outputs.tags.get("Team").map(String::as_str), Some("platform"));

    // Persisted alongside the report.
    assert_eq!(repo.load_outputs().await.unwrap(), Some(outputs));
    assert!(repo.load_report().await.unwrap().is_some());
}

#[tokio::test]
async fn test_invalid_sizing_fails_before_any_call() {
    let sim = Arc::new(SimulatedProvider::new());
    let dir = tempfile::tempdir().unwrap();
    let repo = StateRepository::new(dir.path(), STACK);
    let doc = parse(&stack_yaml((4, 3, 3), DEFAULT_ADDONS));

    let err = handle_apply(&ApplyStack { stack: doc }, &executor(&sim), &repo)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ProvisionError>(),
        Some(ProvisionError::Validation(_))
    ));
    assert!(sim.calls().await.is_empty());
}

#[tokio::test]
async fn test_nodes_wait_for_ready_prerequisites() {
    let sim = Arc::new(SimulatedProvider::new().with_settle_polls(3));
    let compiled = compile_stack(&stack()).unwrap();
    let report = executor(&sim).apply(&compiled.graph).await;
    assert!(report.succeeded(), "{}", report.render());

    let calls = sim.calls().await;
    let network = key(RemoteKind::Network, STACK);
    let subnets = key(RemoteKind::Subnets, STACK);
    let workers = key(RemoteKind::NodeGroup, NODE_GROUP);
    let cluster = key(RemoteKind::Cluster, CLUSTER);
    let first_addon = key(RemoteKind::Addon, &format!("{CLUSTER}/vpc-cni"));
    let access = key(RemoteKind::AccessEntry, &format!("{CLUSTER}/@caller"));

    let pairs = [
        (&network, &subnets),
        (&subnets, &workers),
        (&subnets, &cluster),
        (&cluster, &first_addon),
        (&workers, &first_addon),
        (&cluster, &access),
    ];
    for (prerequisite, dependent) in pairs {
        assert!(
            first_ready_read(&calls, prerequisite) < first_call(&calls, dependent),
            "{dependent} touched before {prerequisite} was ready"
        );
    }
}

#[tokio::test]
async fn test_reapply_is_a_no_op() {
    let sim = Arc::new(SimulatedProvider::new().with_settle_polls(1));
    let compiled = compile_stack(&stack()).unwrap();
    let executor = executor(&sim);
    assert!(executor.apply(&compiled.graph).await.succeeded());

    sim.clear_calls().await;
    let again = executor.apply(&compiled.graph).await;
    assert!(again.succeeded(), "{}", again.render());
    assert!(again.nodes.iter().all(|n| n.outcome == NodeOutcome::Unchanged));
    assert_eq!(sim.mutation_count().await, 0);
}

#[tokio::test]
async fn test_planning_is_deterministic() {
    let a = compile_stack(&stack()).unwrap();
    let b = compile_stack(&stack()).unwrap();
    assert_eq!(a.graph.topological_order(), b.graph.topological_order());
    assert_eq!(a.graph.edges(), b.graph.edges());

    let mut outcomes = Vec::new();
    for compiled in [a, b] {
        let sim = Arc::new(SimulatedProvider::new().with_settle_polls(1));
        let report = executor(&sim).apply(&compiled.graph).await;
        let per_node: Vec<_> = report
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.outcome.clone()))
            .collect();
        outcomes.push(per_node);
    }
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test]
async fn test_control_plane_failure_is_fatal() {
    let sim = Arc::new(
        SimulatedProvider::new().with_failed_creations(CLUSTER, 1, "insufficient capacity in us-east-2a"),
    );
    let compiled = compile_stack(&stack()).unwrap();
    let report = executor(&sim).apply(&compiled.graph).await;

    assert!(!report.succeeded());
    assert!(report.fatal.as_deref().unwrap().contains(CLUSTER));
    let cluster = report.node(&"eks".into()).unwrap();
    assert!(matches!(
        cluster.outcome.error(),
        Some(ProvisionError::Fatal(_))
    ));
    for id in ["eks/addons", "eks/access/@caller"] {
        let node = report.node(&ResourceId::from(id)).unwrap();
        assert!(matches!(node.outcome, NodeOutcome::Skipped { .. }), "{id}");
    }
    // The pool was already in flight and still settles.
    let workers = report.node(&"workers".into()).unwrap();
    assert!(!matches!(workers.outcome, NodeOutcome::Skipped { .. }));

    let calls = sim.calls().await;
    assert!(!calls
        .iter()
        .any(|c| matches!(c.key.kind, RemoteKind::Addon | RemoteKind::AccessEntry)));
}

#[tokio::test]
async fn test_failed_node_group_creation_is_retried() {
    let sim = Arc::new(SimulatedProvider::new().with_failed_creations(NODE_GROUP, 1, "instance launch failed"));
    let compiled = compile_stack(&stack()).unwrap();
    let report = executor(&sim).apply(&compiled.graph).await;

    assert!(report.succeeded(), "{}", report.render());
    let workers = report.node(&"workers".into()).unwrap();
    assert_eq!(workers.outcome, NodeOutcome::Created);
    assert_eq!(workers.attempts, 2);
}

#[tokio::test]
async fn test_throttled_creates_are_retried() {
    let sim = Arc::new(SimulatedProvider::new().with_transient_failures(NODE_GROUP, 2));
    let compiled = compile_stack(&stack()).unwrap();
    let report = executor(&sim).apply(&compiled.graph).await;

    assert!(report.succeeded(), "{}", report.render());
    assert_eq!(report.node(&"workers".into()).unwrap().attempts, 3);
}

#[tokio::test]
async fn test_missing_session_fails_identity_only() {
    let sim = Arc::new(SimulatedProvider::new().with_caller(None));
    let compiled = compile_stack(&stack()).unwrap();
    let report = executor(&sim).apply(&compiled.graph).await;

    assert!(!report.succeeded());
    let identity = report.node(&"identity".into()).unwrap();
    assert!(matches!(
        identity.outcome.error(),
        Some(ProvisionError::Authentication(_))
    ));
    let access = report.node(&"eks/access/@caller".into()).unwrap();
    assert!(matches!(access.outcome, NodeOutcome::Skipped { .. }));
    assert_eq!(report.node(&"eks".into()).unwrap().outcome, NodeOutcome::Created);
    assert_eq!(report.node(&"eks/addons".into()).unwrap().outcome, NodeOutcome::Created);
}

#[tokio::test]
async fn test_overlapping_network_stops_everything_downstream() {
    let sim = Arc::new(SimulatedProvider::new().with_allocated_cidr("172.16.0.0/12".parse().unwrap()));
    let compiled = compile_stack(&stack()).unwrap();
    let report = executor(&sim).apply(&compiled.graph).await;

    let vpc = report.node(&"vpc".into()).unwrap();
    assert!(matches!(
        vpc.outcome.error(),
        Some(ProvisionError::AllocationConflict { .. })
    ));
    for id in ["subnets", "workers", "eks", "eks/addons", "eks/access/@caller"] {
        let node = report.node(&ResourceId::from(id)).unwrap();
        assert!(matches!(node.outcome, NodeOutcome::Skipped { .. }), "{id}");
    }
    assert!(report.fatal.is_none());
}

#[tokio::test]
async fn test_cancelled_run_submits_nothing() {
    let sim = Arc::new(SimulatedProvider::new());
    let compiled = compile_stack(&stack()).unwrap();
    let executor = executor(&sim);
    executor.cancellation_token().cancel();

    let report = executor.apply(&compiled.graph).await;
    assert!(report.cancelled);
    assert!(!report.succeeded());
    assert_eq!(report.nodes.len(), compiled.graph.len());
    assert!(report.nodes.iter().all(|n| matches!(
        &n.outcome,
        NodeOutcome::Skipped { reason } if reason == "cancelled before submission"
    )));
    assert!(sim.calls().await.is_empty());
}

/// Cancels the executor as soon as the network create has been accepted.
struct CancelAfterNetworkCreate {
    inner: Arc<SimulatedProvider>,
    token: OnceLock<CancellationToken>,
}

#[async_trait]
impl Provisioner for CancelAfterNetworkCreate {
    async fn read(&self, key: &RemoteKey) -> Result<Option<Observed>, ProvisionError> {
        self.inner.read(key).await
    }

    async fn create(&self, request: &ResourceRequest) -> Result<(), ProvisionError> {
        self.inner.create(request).await?;
        if request.key().kind == RemoteKind::Network {
            if let Some(token) = self.token.get() {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn update(&self, request: &ResourceRequest) -> Result<(), ProvisionError> {
        self.inner.update(request).await
    }

    async fn delete(&self, key: &RemoteKey) -> Result<(), ProvisionError> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn test_cancel_mid_run_lets_in_flight_node_settle() {
    let sim = Arc::new(SimulatedProvider::new());
    let provider = Arc::new(CancelAfterNetworkCreate {
        inner: sim.clone(),
        token: OnceLock::new(),
    });
    let identity: Arc<dyn IdentityResolver> = sim.clone();
    let executor = provisioning::Executor::new(provider.clone(), identity, fast_config());
    provider.token.set(executor.cancellation_token()).unwrap();

    let compiled = compile_stack(&stack()).unwrap();
    let report = executor.apply(&compiled.graph).await;

    assert!(report.cancelled);
    assert!(!report.succeeded());
    assert_eq!(report.node(&"vpc".into()).unwrap().outcome, NodeOutcome::Created);
    assert!(sim.exists(&key(RemoteKind::Network, STACK)).await);
    for id in ["subnets", "workers", "eks", "eks/addons", "eks/access/@caller"] {
        let node = report.node(&ResourceId::from(id)).unwrap();
        assert!(
            matches!(&node.outcome, NodeOutcome::Skipped { reason } if reason == "cancelled before submission"),
            "{id}"
        );
    }
    assert!(sim
        .calls()
        .await
        .iter()
        .all(|c| c.key.kind == RemoteKind::Network));
}

#[tokio::test]
async fn test_unbounded_operation_timeout_still_applies() {
    let sim = Arc::new(SimulatedProvider::new());
    let identity: Arc<dyn IdentityResolver> = sim.clone();
    let config = provisioning::ExecutionConfig {
        operation_timeout: Duration::MAX,
        ..fast_config()
    };
    let executor = provisioning::Executor::new(sim.clone(), identity, config);

    let compiled = compile_stack(&stack()).unwrap();
    let report = executor.apply(&compiled.graph).await;
    assert!(report.succeeded(), "{}", report.render());
}
