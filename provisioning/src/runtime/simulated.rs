//! In-memory provisioning API and identity service.
//!
//! Objects settle after a configurable number of reads. Faults can be
//! injected per remote name, and every call is logged so tests can assert
//! on ordering.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cluster::{AddonDescriptor, ConflictPolicy};
use crate::identity::{account_from_arn, AssumedRoleArn, CallerIdentity, IdentityResolver};
use crate::ir::{
    AccessEntryOutputs, AddonOutputs, ClusterOutputs, NetworkOutputs, NodeGroupOutputs,
    ResourceOutputs, SubnetsOutputs,
};
use crate::network::Ipv4Cidr;
use crate::util::ProvisionError;

use super::provider::{Observed, Provisioner, RemoteKey, RemoteKind, RemotePhase, ResourceRequest};

const DEFAULT_ACCOUNT: &str = "111122223333";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOp {
    Read,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCall {
    pub seq: u64,
    pub op: CallOp,
    pub key: RemoteKey,
    /// For reads, the phase returned; `None` when the object was absent.
    pub phase: Option<RemotePhase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SimResource {
    request: ResourceRequest,
    phase: RemotePhase,
    serial: u64,
    #[serde(default)]
    polls_left: u32,
    #[serde(default)]
    deleting: bool,
    #[serde(default)]
    fail_with: Option<String>,
}

/// Durable part of the simulated cloud.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimSnapshot {
    resources: Vec<(RemoteKey, SimResource)>,
    next_serial: u64,
}

#[derive(Debug, Default)]
struct SimState {
    resources: BTreeMap<RemoteKey, SimResource>,
    next_serial: u64,
    calls: Vec<ProviderCall>,
    transient: BTreeMap<String, u32>,
    terminal: BTreeMap<String, (u32, String)>,
    unmanaged_addons: BTreeMap<String, AddonDescriptor>,
    allocated: Vec<Ipv4Cidr>,
    exhausted_zones: BTreeSet<String>,
}

impl SimState {
    fn log(&mut self, op: CallOp, key: &RemoteKey, phase: Option<RemotePhase>) {
        let seq = self.calls.len() as u64;
        self.calls.push(ProviderCall {
            seq,
            op,
            key: key.clone(),
            phase,
        });
    }

    fn take_transient(&mut self, name: &str, op: &str) -> Result<(), ProvisionError> {
        if let Some(remaining) = self.transient.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProvisionError::ExternalService(format!(
                    "{op} {name}: request throttled"
                )));
            }
        }
        Ok(())
    }

    fn cluster_ready(&self, cluster_name: &str) -> bool {
        self.resources
            .get(&RemoteKey::new(RemoteKind::Cluster, cluster_name))
            .map(|r| r.phase == RemotePhase::Ready && !r.deleting)
            .unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct SimulatedProvider {
    state: Mutex<SimState>,
    settle_polls: u32,
    region: String,
    caller_arn: Option<String>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            settle_polls: 2,
            region: "us-east-2".into(),
            caller_arn: Some(format!(
                "arn:aws:sts::{DEFAULT_ACCOUNT}:assumed-role/platform-admin/session"
            )),
        }
    }

    pub fn from_snapshot(snapshot: SimSnapshot) -> Self {
        let mut provider = Self::new();
        let state = provider.state.get_mut();
        state.resources = snapshot.resources.into_iter().collect();
        state.next_serial = snapshot.next_serial;
        provider
    }

    /// Reads an object answers with `Pending` before it settles.
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls.max(1);
        self
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    /// `None` simulates a missing session.
    pub fn with_caller(mut self, arn: Option<&str>) -> Self {
        self.caller_arn = arn.map(str::to_string);
        self
    }

    /// The next `times` mutating calls against `name` fail transiently.
    pub fn with_transient_failures(mut self, name: &str, times: u32) -> Self {
        self.state.get_mut().transient.insert(name.to_string(), times);
        self
    }

    /// The next `times` creations of `name` settle in a failed state.
    pub fn with_failed_creations(mut self, name: &str, times: u32, reason: &str) -> Self {
        self.state
            .get_mut()
            .terminal
            .insert(name.to_string(), (times, reason.to_string()));
        self
    }

    /// An add-on installed outside this tool, invisible to `read`.
    pub fn with_unmanaged_addon(mut self, cluster: &str, addon: &str, version: &str) -> Self {
        self.state.get_mut().unmanaged_addons.insert(
            format!("{cluster}/{addon}"),
            AddonDescriptor::new(addon, version),
        );
        self
    }

    /// An address block already in use by something else in the account.
    pub fn with_allocated_cidr(mut self, cidr: Ipv4Cidr) -> Self {
        self.state.get_mut().allocated.push(cidr);
        self
    }

    pub fn with_exhausted_zone(mut self, zone: &str) -> Self {
        self.state.get_mut().exhausted_zones.insert(zone.to_string());
        self
    }

    pub async fn inject_transient_failures(&self, name: &str, times: u32) {
        self.state.lock().await.transient.insert(name.to_string(), times);
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn mutation_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.op != CallOp::Read)
            .count()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Installed version of an add-on, managed or not.
    pub async fn addon_version(&self, cluster: &str, addon: &str) -> Option<String> {
        let state = self.state.lock().await;
        let name = format!("{cluster}/{addon}");
        if let Some(unmanaged) = state.unmanaged_addons.get(&name) {
            return Some(unmanaged.version.clone());
        }
        match state.resources.get(&RemoteKey::new(RemoteKind::Addon, name)) {
            Some(SimResource {
                request: ResourceRequest::Addon(req),
                ..
            }) => Some(req.addon.version.clone()),
            _ => None,
        }
    }

    pub async fn exists(&self, key: &RemoteKey) -> bool {
        self.state.lock().await.resources.contains_key(key)
    }

    pub async fn snapshot(&self) -> SimSnapshot {
        let state = self.state.lock().await;
        SimSnapshot {
            resources: state
                .resources
                .iter()
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect(),
            next_serial: state.next_serial,
        }
    }

    fn account(&self) -> String {
        self.caller_arn
            .as_deref()
            .and_then(account_from_arn)
            .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string())
    }

    fn outputs(&self, request: &ResourceRequest, serial: u64) -> ResourceOutputs {
        let region = &self.region;
        let account = self.account();
        match request {
            ResourceRequest::Network(r) => ResourceOutputs::Network(NetworkOutputs {
                network_id: format!("vpc-{serial:08x}"),
                internet_gateway_id: format!("igw-{serial:08x}"),
                cidr_block: r.cidr_block.to_string(),
            }),
            ResourceRequest::Subnets(r) => {
                let ids = |offset: usize, count: usize, prefix: &str| -> Vec<String> {
                    (0..count)
                        .map(|i| format!("{prefix}-{serial:06x}{:02x}", offset + i))
                        .collect()
                };
                let zones = r.layout.public.len();
                ResourceOutputs::Subnets(SubnetsOutputs {
                    public_subnet_ids: ids(0, zones, "subnet"),
                    private_subnet_ids: ids(zones, r.layout.private.len(), "subnet"),
                    nat_gateway_ids: if r.nat_gateway_enabled {
                        ids(0, zones, "nat")
                    } else {
                        Vec::new()
                    },
                })
            }
            ResourceRequest::NodeGroup(r) => ResourceOutputs::NodeGroup(NodeGroupOutputs {
                node_group_name: r.name.clone(),
                node_group_arn: format!(
                    "arn:aws:eks:{region}:{account}:nodegroup/{}/{}/{serial:08x}",
                    r.cluster_name, r.name
                ),
                desired_size: r.scaling.desired_size,
            }),
            ResourceRequest::Cluster(r) => ResourceOutputs::Cluster(ClusterOutputs {
                cluster_name: r.name.clone(),
                cluster_arn: format!("arn:aws:eks:{region}:{account}:cluster/{}", r.name),
                endpoint: format!("https://{serial:032X}.gr7.{region}.eks.amazonaws.com"),
                kubernetes_version: r.kubernetes_version.clone(),
                oidc_issuer_url: r
                    .oidc_provider_enabled
                    .then(|| format!("https://oidc.eks.{region}.amazonaws.com/id/{serial:032X}")),
            }),
            ResourceRequest::Addon(r) => ResourceOutputs::Addon(AddonOutputs {
                addon_name: r.addon.name.clone(),
                addon_version: r.addon.version.clone(),
                addon_arn: format!(
                    "arn:aws:eks:{region}:{account}:addon/{}/{}/{serial:08x}",
                    r.cluster_name, r.addon.name
                ),
            }),
            ResourceRequest::AccessEntry(r) => ResourceOutputs::AccessEntry(AccessEntryOutputs {
                principal_arn: r.principal_arn.clone(),
                policy_arns: r.associations.iter().map(|a| a.policy_arn.clone()).collect(),
            }),
        }
    }

    fn check_create(state: &mut SimState, request: &ResourceRequest) -> Result<(), ProvisionError> {
        let key = request.key();
        match request {
            ResourceRequest::Network(r) => {
                if let Some(existing) = state.allocated.iter().find(|c| c.overlaps(&r.cidr_block)) {
                    return Err(ProvisionError::AllocationConflict {
                        requested: r.cidr_block.to_string(),
                        existing: existing.to_string(),
                    });
                }
                for (other_key, other) in &state.resources {
                    if let ResourceRequest::Network(net) = &other.request {
                        if *other_key != key && net.cidr_block.overlaps(&r.cidr_block) {
                            return Err(ProvisionError::AllocationConflict {
                                requested: r.cidr_block.to_string(),
                                existing: net.cidr_block.to_string(),
                            });
                        }
                    }
                }
            }
            ResourceRequest::Subnets(r) => {
                let network_exists = state.resources.values().any(|res| {
                    matches!(&res.request, ResourceRequest::Network(_))
                        && format!("vpc-{:08x}", res.serial) == r.network_id
                });
                if !network_exists {
                    return Err(ProvisionError::NotFound(r.network_id.clone()));
                }
                for subnet in r.layout.public.iter().chain(r.layout.private.iter()) {
                    if state.exhausted_zones.contains(&subnet.zone) {
                        return Err(ProvisionError::CapacityExhausted {
                            zone: subnet.zone.clone(),
                            reason: "no free addresses in zone".into(),
                        });
                    }
                }
            }
            ResourceRequest::Addon(r) => {
                if !state.cluster_ready(&r.cluster_name) {
                    return Err(ProvisionError::DependencyNotReady {
                        node: key.name.clone(),
                        dependency: r.cluster_name.clone(),
                    });
                }
                let name = r.name();
                if let Some(existing) = state.unmanaged_addons.get(&name).cloned() {
                    match r.addon.resolve_conflicts_on_create {
                        ConflictPolicy::Overwrite => {
                            state.unmanaged_addons.remove(&name);
                        }
                        _ => {
                            return Err(ProvisionError::ConflictOnUpdate {
                                resource: name,
                                detail: format!(
                                    "{} {} is already installed",
                                    existing.name, existing.version
                                ),
                            })
                        }
                    }
                }
            }
            ResourceRequest::AccessEntry(r) => {
                if !state.cluster_ready(&r.cluster_name) {
                    return Err(ProvisionError::DependencyNotReady {
                        node: key.name.clone(),
                        dependency: r.cluster_name.clone(),
                    });
                }
            }
            ResourceRequest::NodeGroup(_) | ResourceRequest::Cluster(_) => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for SimulatedProvider {
    async fn read(&self, key: &RemoteKey) -> Result<Option<Observed>, ProvisionError> {
        let mut state = self.state.lock().await;
        let mut removed = false;
        let observed = match state.resources.get_mut(key) {
            None => None,
            Some(res) => {
                if res.phase == RemotePhase::Pending {
                    res.polls_left = res.polls_left.saturating_sub(1);
                    if res.polls_left == 0 {
                        if res.deleting {
                            removed = true;
                        } else if let Some(reason) = res.fail_with.take() {
                            res.phase = RemotePhase::Failed { reason };
                        } else {
                            res.phase = RemotePhase::Ready;
                        }
                    }
                }
                if removed {
                    None
                } else {
                    Some((res.phase.clone(), res.request.clone(), res.serial))
                }
            }
        };
        if removed {
            state.resources.remove(key);
        }
        let observed = observed.map(|(phase, applied, serial)| Observed {
            outputs: (phase == RemotePhase::Ready).then(|| self.outputs(&applied, serial)),
            phase,
            applied,
        });
        state.log(CallOp::Read, key, observed.as_ref().map(|o| o.phase.clone()));
        Ok(observed)
    }

    async fn create(&self, request: &ResourceRequest) -> Result<(), ProvisionError> {
        let key = request.key();
        let mut state = self.state.lock().await;
        state.log(CallOp::Create, &key, None);
        state.take_transient(&key.name, "create")?;

        if let Some(existing) = state.resources.get(&key) {
            let replaceable = matches!(existing.phase, RemotePhase::Failed { .. }) || existing.deleting;
            if !replaceable {
                if existing.request == *request {
                    return Ok(());
                }
                return Err(ProvisionError::ConflictOnUpdate {
                    resource: key.to_string(),
                    detail: "already exists with a different configuration".into(),
                });
            }
        }
        Self::check_create(&mut state, request)?;

        let serial = match state.resources.get(&key) {
            Some(existing) => existing.serial,
            None => {
                state.next_serial += 1;
                state.next_serial
            }
        };
        let fail_with = match state.terminal.get_mut(&key.name) {
            Some((remaining, reason)) if *remaining > 0 => {
                *remaining -= 1;
                Some(reason.clone())
            }
            _ => None,
        };
        debug!(resource = %key, serial, "simulated create");
        state.resources.insert(
            key,
            SimResource {
                request: request.clone(),
                phase: RemotePhase::Pending,
                serial,
                polls_left: self.settle_polls,
                deleting: false,
                fail_with,
            },
        );
        Ok(())
    }

    async fn update(&self, request: &ResourceRequest) -> Result<(), ProvisionError> {
        let key = request.key();
        let mut state = self.state.lock().await;
        state.log(CallOp::Update, &key, None);
        state.take_transient(&key.name, "update")?;

        let unmanaged = state.unmanaged_addons.contains_key(&key.name);
        let res = state
            .resources
            .get_mut(&key)
            .ok_or_else(|| ProvisionError::NotFound(key.to_string()))?;
        if res.phase != RemotePhase::Ready || res.deleting {
            return Err(ProvisionError::ExternalService(format!("{key} is not ready for update")));
        }

        let mut accepted = request.clone();
        match (&mut accepted, &res.request) {
            (ResourceRequest::Network(want), ResourceRequest::Network(have)) => {
                if want.cidr_block != have.cidr_block {
                    return Err(ProvisionError::ConflictOnUpdate {
                        resource: key.to_string(),
                        detail: format!("cidr_block {} cannot change to {}", have.cidr_block, want.cidr_block),
                    });
                }
            }
            (ResourceRequest::Addon(want), ResourceRequest::Addon(have)) => {
                let diverged = want.addon.configuration_values != have.addon.configuration_values;
                match want.addon.resolve_conflicts_on_update {
                    ConflictPolicy::None if diverged || unmanaged => {
                        return Err(ProvisionError::ConflictOnUpdate {
                            resource: key.name.clone(),
                            detail: "configuration_values differ from the installed add-on".into(),
                        })
                    }
                    ConflictPolicy::Preserve => {
                        want.addon.configuration_values = have.addon.configuration_values.clone();
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        debug!(resource = %key, "simulated update");
        res.request = accepted;
        res.phase = RemotePhase::Pending;
        res.polls_left = self.settle_polls;
        Ok(())
    }

    async fn delete(&self, key: &RemoteKey) -> Result<(), ProvisionError> {
        let mut state = self.state.lock().await;
        state.log(CallOp::Delete, key, None);
        state.take_transient(&key.name, "delete")?;
        if let Some(res) = state.resources.get_mut(key) {
            debug!(resource = %key, "simulated delete");
            res.deleting = true;
            res.phase = RemotePhase::Pending;
            res.polls_left = self.settle_polls;
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityResolver for SimulatedProvider {
    async fn caller_identity(&self) -> Result<CallerIdentity, ProvisionError> {
        let arn = self
            .caller_arn
            .clone()
            .ok_or_else(|| ProvisionError::Authentication("no valid session".into()))?;
        Ok(CallerIdentity {
            account: self.account(),
            user_id: arn.rsplit('/').next().unwrap_or_default().to_string(),
            arn,
        })
    }

    async fn session_issuer(&self, session_arn: &str) -> Result<String, ProvisionError> {
        AssumedRoleArn::parse(session_arn)
            .map(|a| a.issuer_role_arn())
            .ok_or_else(|| ProvisionError::Authentication(format!("{session_arn} is not an assumed-role session")))
    }
}
