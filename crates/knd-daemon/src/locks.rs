//! Per-kernel operation locks.
//!
//! Every mutation of one kernel — lifecycle transitions and execution
//! admission — runs under that kernel's async lock, so a restart and a new
//! execution on the same kernel are strictly ordered while unrelated
//! kernels never contend. This replaces any global lock: one logical lock
//! per kernel id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use knd_core::registry::KernelId;

/// Map of kernel id to its operation lock.
#[derive(Debug, Default)]
pub struct KernelLocks {
    locks: Mutex<HashMap<KernelId, Arc<tokio::sync::Mutex<()>>>>,
}

impl KernelLocks {
    /// Creates an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for a kernel, creating it on first use.
    #[must_use]
    pub fn for_kernel(&self, kernel_id: &KernelId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock poisoned");
        Arc::clone(
            locks
                .entry(kernel_id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Drops a kernel's lock entry after the kernel is gone. Holders of an
    /// already-cloned `Arc` finish undisturbed.
    pub fn remove(&self, kernel_id: &KernelId) {
        let mut locks = self.locks.lock().expect("lock poisoned");
        locks.remove(kernel_id);
    }
}
