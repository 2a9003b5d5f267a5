//! Exclusive CPU core accounting.
//!
//! Hands out disjoint core subsets with exclusive affinity. Allocation
//! prefers the smallest contiguous free run that fits the request (best
//! fit); when no single run is large enough it gathers cores from the
//! smallest fragments first, keeping large runs intact for later
//! contiguous requests.

use std::collections::BTreeSet;

use super::ResourceError;

/// Free-set allocator over a fixed set of host core ids.
///
/// Not internally synchronized; [`super::ResourceAllocator`] guards it with
/// the allocator-wide critical section.
#[derive(Debug)]
pub struct CpuAllocator {
    all: BTreeSet<u32>,
    free: BTreeSet<u32>,
    max_per_kernel: usize,
}

impl CpuAllocator {
    /// Creates an allocator over the given core ids with a hard per-kernel
    /// ceiling.
    #[must_use]
    pub fn new(cores: impl IntoIterator<Item = u32>, max_per_kernel: usize) -> Self {
        let all: BTreeSet<u32> = cores.into_iter().collect();
        Self {
            free: all.clone(),
            all,
            max_per_kernel,
        }
    }

    /// Total number of managed cores.
    #[must_use]
    pub fn total(&self) -> usize {
        self.all.len()
    }

    /// Number of currently unassigned cores.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Allocates an exclusive core subset of the requested size.
    ///
    /// The request is clamped to the per-kernel ceiling before allocation;
    /// a kernel never monopolizes the node even when more cores are free.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::InsufficientCores`] when fewer cores are
    /// free than the (clamped) request needs.
    pub fn allocate(&mut self, requested: usize) -> Result<BTreeSet<u32>, ResourceError> {
        let count = requested.min(self.max_per_kernel).max(1);
        if self.free.len() < count {
            return Err(ResourceError::InsufficientCores {
                requested: count,
                free: self.free.len(),
            });
        }

        let runs = self.free_runs();
        // Best fit: the smallest run that covers the whole request.
        let picked: Vec<u32> = if let Some(run) = runs
            .iter()
            .filter(|run| run.len() >= count)
            .min_by_key(|run| run.len())
        {
            run.iter().copied().take(count).collect()
        } else {
            // No contiguous run fits; consume the smallest fragments first.
            let mut sorted = runs;
            sorted.sort_by_key(Vec::len);
            sorted
                .into_iter()
                .flatten()
                .take(count)
                .collect()
        };

        for core in &picked {
            self.free.remove(core);
        }
        Ok(picked.into_iter().collect())
    }

    /// Returns the given cores to the free set.
    ///
    /// Cores outside the managed set are ignored; double release is a no-op
    /// per core.
    pub fn release(&mut self, cores: &BTreeSet<u32>) {
        for core in cores {
            if self.all.contains(core) {
                self.free.insert(*core);
            }
        }
    }

    /// Maximal runs of consecutive free core ids, in ascending order.
    fn free_runs(&self) -> Vec<Vec<u32>> {
        let mut runs: Vec<Vec<u32>> = Vec::new();
        let mut current: Vec<u32> = Vec::new();
        for &core in &self.free {
            match current.last() {
                Some(&prev) if core == prev + 1 => current.push(core),
                Some(_) => {
                    runs.push(std::mem::take(&mut current));
                    current.push(core);
                }
                None => current.push(core),
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }
        runs
    }
}
