//! Host port pool for published kernel service ports.
//!
//! Each kernel draws its host-visible service ports from one configured
//! inclusive range. Ports are unique across live kernels and return to the
//! pool on destroy. Release filters to the configured range: after an agent
//! restart with a different range, stale ports from old kernels must not
//! leak into the pool.

use std::collections::BTreeSet;

use super::ResourceError;

/// Free-set allocator over an inclusive host port range.
#[derive(Debug)]
pub struct PortAllocator {
    range: (u16, u16),
    free: BTreeSet<u16>,
}

impl PortAllocator {
    /// Creates a pool over `[start, end]` inclusive.
    #[must_use]
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            range: (start, end),
            free: (start..=end).collect(),
        }
    }

    /// Number of currently unassigned ports.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Draws `count` unique ports from the pool, lowest first.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::InsufficientPorts`] when the pool has fewer
    /// than `count` ports left.
    pub fn allocate(&mut self, count: usize) -> Result<Vec<u16>, ResourceError> {
        if self.free.len() < count {
            return Err(ResourceError::InsufficientPorts {
                requested: count,
                free: self.free.len(),
            });
        }
        let picked: Vec<u16> = self.free.iter().copied().take(count).collect();
        for port in &picked {
            self.free.remove(port);
        }
        Ok(picked)
    }

    /// Returns ports to the pool, dropping any outside the configured range.
    pub fn release(&mut self, ports: &[u16]) {
        let (start, end) = self.range;
        for &port in ports {
            if (start..=end).contains(&port) {
                self.free.insert(port);
            }
        }
    }
}
