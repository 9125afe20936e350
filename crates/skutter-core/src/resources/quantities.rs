use crate::{CoreError, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

/// CPU and memory amounts for pods and nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    /// CPU in millicores (1000 = 1 core)
    pub cpu_millicores: i64,
    /// Memory in bytes
    pub memory_bytes: i64,
}

impl ResourceQuantities {
    pub fn new(cpu_millicores: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millicores,
            memory_bytes,
        }
    }

    /// Parse CPU string (e.g., "2", "1000m", "0.5")
    pub fn parse_cpu(s: &str) -> Result<i64> {
        let millicores = if let Some(m) = s.strip_suffix('m') {
            m.parse::<i64>()
                .map_err(|e| CoreError::invalid_quantity(s, e.to_string()))?
        } else if let Ok(cores) = s.parse::<f64>() {
            // Float casts saturate at the i64 bounds
            (cores * 1000.0) as i64
        } else {
            return Err(CoreError::invalid_quantity(s, "not a CPU quantity"));
        };
        non_negative(s, millicores)
    }

    /// Parse memory string (e.g., "128Mi", "1Gi", "500M", "1024")
    pub fn parse_memory(s: &str) -> Result<i64> {
        const SUFFIXES: [(&str, i64); 6] = [
            ("Ki", 1 << 10),
            ("Mi", 1 << 20),
            ("Gi", 1 << 30),
            ("k", 1_000),
            ("M", 1_000_000),
            ("G", 1_000_000_000),
        ];

        for (suffix, factor) in SUFFIXES {
            if let Some(num) = s.strip_suffix(suffix) {
                let n = num
                    .parse::<i64>()
                    .map_err(|e| CoreError::invalid_quantity(s, e.to_string()))?;
                let bytes = n
                    .checked_mul(factor)
                    .ok_or_else(|| CoreError::invalid_quantity(s, "overflow"))?;
                return non_negative(s, bytes);
            }
        }

        let bytes = s
            .parse::<i64>()
            .map_err(|e| CoreError::invalid_quantity(s, e.to_string()))?;
        non_negative(s, bytes)
    }

    /// Read CPU and memory from a k8s resource map; unparseable entries count as zero
    pub fn from_k8s_resource_map(resources: &BTreeMap<String, Quantity>) -> Self {
        let cpu_millicores = resources
            .get("cpu")
            .and_then(|q| Self::parse_cpu(&q.0).ok())
            .unwrap_or(0);

        let memory_bytes = resources
            .get("memory")
            .and_then(|q| Self::parse_memory(&q.0).ok())
            .unwrap_or(0);

        Self {
            cpu_millicores,
            memory_bytes,
        }
    }

    /// Component-wise maximum
    pub fn max(self, other: Self) -> Self {
        Self {
            cpu_millicores: self.cpu_millicores.max(other.cpu_millicores),
            memory_bytes: self.memory_bytes.max(other.memory_bytes),
        }
    }

    /// Subtract, flooring each component at zero
    pub fn saturating_sub(self, other: Self) -> Self {
        Self {
            cpu_millicores: self.cpu_millicores.saturating_sub(other.cpu_millicores).max(0),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes).max(0),
        }
    }

    /// Whether `self` fits inside `capacity` on every dimension
    pub fn fits_within(&self, capacity: &Self) -> bool {
        self.cpu_millicores <= capacity.cpu_millicores
            && self.memory_bytes <= capacity.memory_bytes
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millicores == 0 && self.memory_bytes == 0
    }
}

fn non_negative(s: &str, value: i64) -> Result<i64> {
    if value < 0 {
        return Err(CoreError::invalid_quantity(s, "must not be negative"));
    }
    Ok(value)
}

/// Saturates at `i64::MAX`, so an oversized request can never fit a node
impl Add for ResourceQuantities {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            cpu_millicores: self.cpu_millicores.saturating_add(other.cpu_millicores),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }
}

impl AddAssign for ResourceQuantities {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!(ResourceQuantities::parse_cpu("1").unwrap(), 1000);
        assert_eq!(ResourceQuantities::parse_cpu("0.5").unwrap(), 500);
        assert_eq!(ResourceQuantities::parse_cpu("100m").unwrap(), 100);
        assert!(ResourceQuantities::parse_cpu("lots").is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(ResourceQuantities::parse_memory("1024").unwrap(), 1024);
        assert_eq!(ResourceQuantities::parse_memory("1Ki").unwrap(), 1024);
        assert_eq!(
            ResourceQuantities::parse_memory("128Mi").unwrap(),
            128 * 1024 * 1024
        );
        assert_eq!(ResourceQuantities::parse_memory("2G").unwrap(), 2_000_000_000);
        assert!(ResourceQuantities::parse_memory("12Qi").is_err());
    }

    #[test]
    fn test_arithmetic_and_fit() {
        let node = ResourceQuantities::new(4000, 8 << 30);
        let used = ResourceQuantities::new(3000, 2 << 30);
        let request = ResourceQuantities::new(1500, 1 << 30);

        let free = node.saturating_sub(used);
        assert_eq!(free, ResourceQuantities::new(1000, 6 << 30));
        assert!(!request.fits_within(&free));
        assert!((used + ResourceQuantities::new(1000, 0)).fits_within(&node));
        assert_eq!(
            used.saturating_sub(node),
            ResourceQuantities::default()
        );
    }

    #[test]
    fn test_addition_saturates() {
        let huge = ResourceQuantities::new(0, 5_000_000_000 * 1_000_000_000);
        let sum = huge + huge;
        assert_eq!(sum.memory_bytes, i64::MAX);
        assert!(!sum.fits_within(&ResourceQuantities::new(i64::MAX, i64::MAX - 1)));

        let mut acc = ResourceQuantities::new(i64::MAX, 0);
        acc += ResourceQuantities::new(1, 1);
        assert_eq!(acc, ResourceQuantities::new(i64::MAX, 1));
    }

    #[test]
    fn test_saturating_sub_with_extreme_values() {
        let free = ResourceQuantities::new(i64::MAX, 0)
            .saturating_sub(ResourceQuantities::new(i64::MIN, i64::MAX));
        assert_eq!(free, ResourceQuantities::new(i64::MAX, 0));
    }

    #[test]
    fn test_negative_quantities_rejected() {
        assert!(ResourceQuantities::parse_cpu("-1").is_err());
        assert!(ResourceQuantities::parse_cpu("-500m").is_err());
        assert!(ResourceQuantities::parse_memory("-1Gi").is_err());
        assert!(ResourceQuantities::parse_memory("-1024").is_err());
    }
}
