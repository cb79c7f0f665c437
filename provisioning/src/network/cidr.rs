use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::util::ProvisionError;

/// IPv4 address block in CIDR notation with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, ProvisionError> {
        if prefix > 32 {
            return Err(ProvisionError::validation(format!("prefix /{prefix} is out of range")));
        }
        let network = u32::from(addr);
        if network & !mask(prefix) != 0 {
            return Err(ProvisionError::validation(format!(
                "{addr}/{prefix} has host bits set"
            )));
        }
        Ok(Self { network, prefix })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    /// Same numbering as Terraform's `cidrsubnet(prefix, newbits, netnum)`.
    pub fn subnet(&self, newbits: u8, netnum: u32) -> Option<Ipv4Cidr> {
        let prefix = self.prefix.checked_add(newbits)?;
        if prefix > 32 || u64::from(netnum) >= 1u64 << newbits {
            return None;
        }
        let offset = if newbits == 0 {
            0
        } else {
            netnum << (32 - u32::from(prefix))
        };
        Some(Ipv4Cidr {
            network: self.network | offset,
            prefix,
        })
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        let common = mask(self.prefix.min(other.prefix));
        self.network & common == other.network & common
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| ProvisionError::validation(format!("{s} is not in CIDR notation")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| ProvisionError::validation(format!("{s} has an invalid address")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ProvisionError::validation(format!("{s} has an invalid prefix")))?;
        Ipv4Cidr::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.prefix)
    }
}
