//! Node cost allocation
//!
//! Without independent market prices per resource type, one CPU core is
//! treated as cost-equivalent to one GiB of memory. A node's hourly price is
//! split evenly across `cores + GiB` units and pods pay for the units they
//! have allocated.

use crate::error::AllocationError;
use crate::models::Allocatable;

pub const MIB: f64 = 1024.0 * 1024.0;
pub const GIB: f64 = 1024.0 * MIB;

/// Reference prices derived from one node price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitPrices {
    pub cpu_core_hourly: f64,
    pub memory_mib_hourly: f64,
}

/// Split a node's hourly price into per-core and per-MiB prices
pub fn unit_prices(node_hourly: f64, allocatable: &Allocatable) -> Result<UnitPrices, AllocationError> {
    if !node_hourly.is_finite() || node_hourly < 0.0 {
        return Err(AllocationError::InvalidPrice(node_hourly));
    }

    let cpu = allocatable.cpu_cores.max(0.0);
    let unit_count = cpu + allocatable.memory_bytes as f64 / GIB;
    if !unit_count.is_finite() || unit_count <= 0.0 {
        return Err(AllocationError::NoAllocatableUnits);
    }

    let unit_price = node_hourly / unit_count;
    Ok(UnitPrices {
        cpu_core_hourly: unit_price,
        memory_mib_hourly: unit_price / 1024.0,
    })
}

/// Hourly cost of a pod's allocation at the given reference prices
///
/// Allocation above the node's allocatable is priced as-is.
pub fn pod_hourly_cost(prices: &UnitPrices, allocated: &Allocatable) -> f64 {
    allocated.cpu_cores.max(0.0) * prices.cpu_core_hourly
        + (allocated.memory_bytes as f64 / MIB) * prices.memory_mib_hourly
}
