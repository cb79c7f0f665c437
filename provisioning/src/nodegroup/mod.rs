use serde::{Deserialize, Serialize};

use crate::util::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub min_size: u32,
    pub desired_size: u32,
    pub max_size: u32,
}

impl ScalingConfig {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.max_size == 0 {
            return Err(ProvisionError::validation("max_size must be at least 1"));
        }
        if self.min_size > self.desired_size || self.desired_size > self.max_size {
            return Err(ProvisionError::validation(format!(
                "scaling bounds must satisfy min <= desired <= max, got min={} desired={} max={}",
                self.min_size, self.desired_size, self.max_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupSpec {
    pub instance_types: Vec<String>,
    pub min_size: u32,
    pub desired_size: u32,
    pub max_size: u32,
    /// Registers the pool for discovery by an external cluster autoscaler.
    #[serde(default)]
    pub cluster_autoscaler_enabled: bool,
}

impl NodeGroupSpec {
    pub fn scaling(&self) -> ScalingConfig {
        ScalingConfig {
            min_size: self.min_size,
            desired_size: self.desired_size,
            max_size: self.max_size,
        }
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.instance_types.is_empty() {
            return Err(ProvisionError::validation("node group needs at least one instance type"));
        }
        if self.instance_types.iter().any(|t| t.trim().is_empty()) {
            return Err(ProvisionError::validation("instance type names must not be empty"));
        }
        self.scaling().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(min: u32, desired: u32, max: u32) -> NodeGroupSpec {
        NodeGroupSpec {
            instance_types: vec!["t3.medium".into()],
            min_size: min,
            desired_size: desired,
            max_size: max,
            cluster_autoscaler_enabled: false,
        }
    }

    #[test]
    fn test_valid_bounds() {
        assert!(spec(1, 3, 3).validate().is_ok());
        assert!(spec(0, 0, 1).validate().is_ok());
        assert!(spec(2, 2, 2).validate().is_ok());
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(spec(4, 3, 3).validate().is_err());
        assert!(spec(1, 4, 3).validate().is_err());
        assert!(spec(0, 0, 0).validate().is_err());
    }

    #[test]
    fn test_instance_types_required() {
        let mut s = spec(1, 1, 1);
        s.instance_types.clear();
        assert!(matches!(s.validate(), Err(ProvisionError::Validation(_))));
    }
}
