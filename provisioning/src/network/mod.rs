//! Network and per-zone subnetwork descriptors.

pub mod cidr;

use serde::{Deserialize, Serialize};

use crate::label::{reserved_tags, Label, TagRole, TagSet};
use crate::util::ProvisionError;

pub use cidr::Ipv4Cidr;

/// Smallest subnet the provider accepts.
pub const MIN_SUBNET_PREFIX: u8 = 28;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub cidr_block: String,
}

impl NetworkSpec {
    pub fn cidr(&self) -> Result<Ipv4Cidr, ProvisionError> {
        self.cidr_block.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetsSpec {
    pub availability_zones: Vec<String>,
    #[serde(default = "default_true")]
    pub nat_gateway_enabled: bool,
}

impl SubnetsSpec {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.availability_zones.is_empty() {
            return Err(ProvisionError::validation("at least one availability zone is required"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for zone in &self.availability_zones {
            if zone.trim().is_empty() {
                return Err(ProvisionError::validation("availability zone names must not be empty"));
            }
            if !seen.insert(zone) {
                return Err(ProvisionError::validation(format!(
                    "availability zone {zone} is listed twice"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetRole {
    Public,
    Private,
}

impl SubnetRole {
    fn as_str(&self) -> &'static str {
        match self {
            SubnetRole::Public => "public",
            SubnetRole::Private => "private",
        }
    }

    fn tag_role(&self) -> TagRole {
        match self {
            SubnetRole::Public => TagRole::PublicSubnet,
            SubnetRole::Private => TagRole::PrivateSubnet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetPlan {
    pub name: String,
    pub zone: String,
    pub role: SubnetRole,
    pub cidr_block: Ipv4Cidr,
    pub tags: TagSet,
}

/// Subnets in input zone order. Integrations bind positionally, so the
/// order must never be re-sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetLayout {
    pub public: Vec<SubnetPlan>,
    pub private: Vec<SubnetPlan>,
}

/// `ceil(log2(2 * zones))`: room for one public and one private subnet per zone.
pub fn subnet_bits(zone_count: usize) -> u8 {
    let slots = (zone_count.max(1) * 2) as u64;
    (u64::BITS - (slots - 1).leading_zeros()) as u8
}

/// Private subnets take slots `0..n`, public subnets `n..2n`.
pub fn plan_subnets(
    vpc: Ipv4Cidr,
    zones: &[String],
    label: &Label,
    cluster_name: &str,
) -> Result<SubnetLayout, ProvisionError> {
    if zones.is_empty() {
        return Err(ProvisionError::validation("at least one availability zone is required"));
    }
    let bits = subnet_bits(zones.len());
    let count = zones.len() as u32;

    let plan = |role: SubnetRole, zone: &str, netnum: u32| -> Result<SubnetPlan, ProvisionError> {
        let cidr_block = vpc
            .subnet(bits, netnum)
            .filter(|c| c.prefix() <= MIN_SUBNET_PREFIX)
            .ok_or_else(|| ProvisionError::CapacityExhausted {
                zone: zone.to_string(),
                reason: format!(
                    "{vpc} cannot hold {} subnets of at least /{MIN_SUBNET_PREFIX}",
                    zones.len() * 2
                ),
            })?;
        let child = label.with_attributes(&[role.as_str(), zone]);
        let mut extra = TagSet::new();
        extra.insert("Type".into(), role.as_str().into());
        extra.insert("Zone".into(), zone.to_string());
        extra.extend(reserved_tags(role.tag_role(), cluster_name));
        Ok(SubnetPlan {
            name: child.id().to_string(),
            zone: zone.to_string(),
            role,
            cidr_block,
            tags: child.tags_with(extra),
        })
    };

    let mut private = Vec::with_capacity(zones.len());
    let mut public = Vec::with_capacity(zones.len());
    for (i, zone) in zones.iter().enumerate() {
        private.push(plan(SubnetRole::Private, zone, i as u32)?);
        public.push(plan(SubnetRole::Public, zone, count + i as u32)?);
    }
    Ok(SubnetLayout { public, private })
}
