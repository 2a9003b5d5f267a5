//! Resource grant accounting for one node.
//!
//! The allocator tracks the node's partitionable resources — an exclusive
//! CPU core set, per-plugin accelerator shares, and the published host port
//! pool — and issues grants that are created and released atomically: two
//! concurrent allocations never double-assign a core, over-commit a device,
//! or hand out the same port, and a failed multi-part allocation rolls back
//! everything it acquired before surfacing the error.
//!
//! # Architecture
//!
//! ```text
//! ResourceAllocator
//!     |
//!     +-- pools (Mutex)            allocator-wide critical section
//!     |     +-- CpuAllocator      exclusive core sets, per-kernel ceiling
//!     |     +-- PortAllocator     published service ports
//!     |
//!     +-- accelerators            plugin id -> AcceleratorAllocator
//! ```
//!
//! # Invariants
//!
//! - The union of all live grants' CPU sets is disjoint
//! - Per accelerator, live reserved units never exceed capacity
//! - No partial grant survives a failed allocation

pub mod accel;
pub mod cpu;
pub mod ports;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use accel::{AcceleratorAllocator, AcceleratorReservation, FractionalDevicePool};
pub use cpu::CpuAllocator;
pub use ports::PortAllocator;

use crate::config::{PortRangeConfig, ResourceConfig};
use crate::error::AgentError;

/// Failure inside the resource accounting layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ResourceError {
    /// Not enough free cores for the request.
    #[error("insufficient free cores: requested {requested}, free {free}")]
    InsufficientCores {
        /// Cores needed after ceiling clamping.
        requested: usize,
        /// Cores currently free.
        free: usize,
    },

    /// Not enough free share units on an accelerator.
    #[error("insufficient shares on '{plugin_id}': requested {requested}, free {free}")]
    InsufficientShares {
        /// The accelerator plugin.
        plugin_id: String,
        /// Units requested.
        requested: u64,
        /// Units currently free.
        free: u64,
    },

    /// Not enough free host ports.
    #[error("insufficient free host ports: requested {requested}, free {free}")]
    InsufficientPorts {
        /// Ports requested.
        requested: usize,
        /// Ports currently free.
        free: usize,
    },

    /// The request names an accelerator plugin this node does not have.
    #[error("unknown accelerator plugin '{plugin_id}'")]
    UnknownPlugin {
        /// The unrecognized plugin id.
        plugin_id: String,
    },
}

impl From<ResourceError> for AgentError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::UnknownPlugin { .. } => Self::InvalidRequest {
                reason: err.to_string(),
            },
            _ => Self::InsufficientResources {
                reason: err.to_string(),
            },
        }
    }
}

/// What a kernel asks for at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Exclusive cores wanted (clamped by the configured ceiling).
    pub cpu_count: usize,
    /// Accelerator share requests, one per plugin.
    #[serde(default)]
    pub accelerators: Vec<AcceleratorRequest>,
    /// Host ports to publish for kernel services.
    #[serde(default)]
    pub port_count: usize,
}

/// One accelerator share request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorRequest {
    /// Target plugin.
    pub plugin_id: String,
    /// Share units wanted.
    pub units: u64,
}

/// The concrete resources reserved for one kernel.
///
/// Created atomically with kernel creation and released atomically with
/// destruction (or with a failed creation's unwind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    /// Exclusive-affinity core set.
    pub cpu_set: BTreeSet<u32>,
    /// Accelerator reservations.
    pub accelerators: Vec<AcceleratorReservation>,
    /// Published host ports.
    pub host_ports: Vec<u16>,
}

/// Point-in-time capacity view for the heartbeat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Managed cores.
    pub total_cores: usize,
    /// Unassigned cores.
    pub free_cores: usize,
    /// Unassigned host ports.
    pub free_ports: usize,
    /// Per-plugin accelerator capacity.
    pub accelerators: Vec<AcceleratorSnapshot>,
}

/// Per-plugin accelerator capacity view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorSnapshot {
    /// Plugin id.
    pub plugin_id: String,
    /// Total share units.
    pub capacity_units: u64,
    /// Unreserved share units.
    pub free_units: u64,
}

#[derive(Debug)]
struct Pools {
    cpu: CpuAllocator,
    ports: PortAllocator,
}

/// Node-wide resource allocator.
///
/// Allocation and release share one critical section; allocation is rare
/// relative to request handling, so coarse locking is acceptable and keeps
/// the accounting trivially consistent.
#[derive(Debug)]
pub struct ResourceAllocator {
    pools: Mutex<Pools>,
    accelerators: BTreeMap<String, Arc<dyn AcceleratorAllocator>>,
}

impl ResourceAllocator {
    /// Builds the allocator from configuration, registering a stock
    /// [`FractionalDevicePool`] per configured accelerator.
    #[must_use]
    pub fn from_config(resources: &ResourceConfig, ports: &PortRangeConfig) -> Self {
        let accelerators = resources
            .accelerators
            .iter()
            .map(|accel| {
                (
                    accel.plugin_id.clone(),
                    Arc::new(FractionalDevicePool::from_config(accel))
                        as Arc<dyn AcceleratorAllocator>,
                )
            })
            .collect();
        Self {
            pools: Mutex::new(Pools {
                cpu: CpuAllocator::new(
                    resources.cpu_cores.iter().copied(),
                    resources.max_cores_per_kernel,
                ),
                ports: PortAllocator::new(ports.start, ports.end),
            }),
            accelerators,
        }
    }

    /// Registers an additional accelerator plugin (vendor-specific
    /// allocators implement [`AcceleratorAllocator`] and are installed
    /// here).
    #[must_use]
    pub fn with_accelerator(mut self, allocator: Arc<dyn AcceleratorAllocator>) -> Self {
        self.accelerators
            .insert(allocator.plugin_id().to_string(), allocator);
        self
    }

    /// Atomically reserves a full grant for one kernel.
    ///
    /// Partial acquisitions are rolled back before the error surfaces: a
    /// failed allocation leaves the pools exactly as they were.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] naming the exhausted pool; the failure is
    /// non-fatal and the caller may retry after backoff.
    pub fn allocate(&self, request: &ResourceRequest) -> Result<ResourceGrant, ResourceError> {
        let mut pools = self.pools.lock().expect("lock poisoned");

        let cpu_set = pools.cpu.allocate(request.cpu_count)?;

        let mut reservations: Vec<AcceleratorReservation> = Vec::new();
        for accel_request in &request.accelerators {
            let allocator = match self.accelerators.get(&accel_request.plugin_id) {
                Some(allocator) => allocator,
                None => {
                    self.unwind(&mut pools, &cpu_set, &reservations, &[]);
                    return Err(ResourceError::UnknownPlugin {
                        plugin_id: accel_request.plugin_id.clone(),
                    });
                }
            };
            match allocator.reserve(accel_request.units) {
                Ok(reservation) => reservations.push(reservation),
                Err(err) => {
                    self.unwind(&mut pools, &cpu_set, &reservations, &[]);
                    return Err(err);
                }
            }
        }

        let host_ports = match pools.ports.allocate(request.port_count) {
            Ok(host_ports) => host_ports,
            Err(err) => {
                self.unwind(&mut pools, &cpu_set, &reservations, &[]);
                return Err(err);
            }
        };

        debug!(
            cores = cpu_set.len(),
            accelerators = reservations.len(),
            ports = host_ports.len(),
            "resource grant issued"
        );
        Ok(ResourceGrant {
            cpu_set,
            accelerators: reservations,
            host_ports,
        })
    }

    /// Returns a grant's resources to the pools.
    pub fn release(&self, grant: &ResourceGrant) {
        let mut pools = self.pools.lock().expect("lock poisoned");
        self.unwind(&mut pools, &grant.cpu_set, &grant.accelerators, &grant.host_ports);
        debug!(cores = grant.cpu_set.len(), "resource grant released");
    }

    /// Point-in-time capacity view; safe to call without blocking grants
    /// for longer than the accounting update itself.
    #[must_use]
    pub fn snapshot(&self) -> ResourceSnapshot {
        let pools = self.pools.lock().expect("lock poisoned");
        ResourceSnapshot {
            total_cores: pools.cpu.total(),
            free_cores: pools.cpu.free_count(),
            free_ports: pools.ports.free_count(),
            accelerators: self
                .accelerators
                .values()
                .map(|allocator| AcceleratorSnapshot {
                    plugin_id: allocator.plugin_id().to_string(),
                    capacity_units: allocator.capacity_units(),
                    free_units: allocator.free_units(),
                })
                .collect(),
        }
    }

    fn unwind(
        &self,
        pools: &mut Pools,
        cpu_set: &BTreeSet<u32>,
        reservations: &[AcceleratorReservation],
        host_ports: &[u16],
    ) {
        pools.cpu.release(cpu_set);
        pools.ports.release(host_ports);
        for reservation in reservations {
            if let Some(allocator) = self.accelerators.get(&reservation.plugin_id) {
                allocator.release(reservation);
            }
        }
    }
}
