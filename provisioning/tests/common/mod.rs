#![allow(dead_code)]

use provisioning::identity::IdentityResolver;
use provisioning::meta::parse_document;
use provisioning::runtime::{RetryConfig, SimulatedProvider};
use provisioning::{ExecutionConfig, Executor, StackDocument};
use std::sync::Arc;
use std::time::Duration;

pub const STACK: &str = "eg-eks-test";
pub const CLUSTER: &str = "eg-eks-test-cluster";
pub const NODE_GROUP: &str = "eg-eks-test-workers";

pub fn fast_config() -> ExecutionConfig {
    ExecutionConfig {
        concurrency: 4,
        poll_interval: Duration::from_millis(1),
        operation_timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
    }
}

/// A full stack with the given node-group sizing and add-on block.
pub fn stack_yaml(sizing: (u32, u32, u32), addons: &str) -> String {
    let (min, desired, max) = sizing;
    format!(
        r#"
label:
  namespace: eg
  name: eks
  stage: test
  tags:
    Team: platform
region: us-east-2
resources:
  - id: vpc
    kind: network
    cidr_block: 172.16.0.0/16
  - id: subnets
    kind: subnets
    availability_zones: [us-east-2a, us-east-2b, us-east-2c]
  - id: workers
    kind: node_group
    instance_types: [t3.medium]
    min_size: {min}
    desired_size: {desired}
    max_size: {max}
    cluster_autoscaler_enabled: true
  - id: eks
    kind: cluster
    kubernetes_version: "1.30"
    oidc_provider_enabled: true
    access_entries:
      "@caller":
        policies:
          ClusterAdmin:
            type: cluster
{addons}
"#
    )
}

pub const DEFAULT_ADDONS: &str = r#"    addons:
      - name: vpc-cni
        version: v1.18.1-eksbuild.1
      - name: kube-proxy
        version: v1.30.0-eksbuild.3
      - name: coredns
        version: v1.11.1-eksbuild.9
"#;

pub fn stack() -> StackDocument {
    parse(&stack_yaml((1, 3, 3), DEFAULT_ADDONS))
}

pub fn parse(raw: &str) -> StackDocument {
    parse_document(raw).expect("stack parses")
}

pub fn executor(sim: &Arc<SimulatedProvider>) -> Executor {
    let identity: Arc<dyn IdentityResolver> = sim.clone();
    Executor::new(sim.clone(), identity, fast_config())
}
