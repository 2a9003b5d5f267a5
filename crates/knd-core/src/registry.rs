//! Kernel registry and lifecycle state machine.
//!
//! The registry is the single source of truth for kernel liveness. Entries
//! are owned by the lifecycle manager; the execution engine and stats
//! collector reference kernels by id and read through the registry. Reads
//! are concurrent; mutations of one entry are serialized by the per-kernel
//! operation lock the daemon layer holds around lifecycle transitions.
//!
//! # State machine
//!
//! ```text
//! PREPARING ──▶ RUNNING ──▶ RESTARTING ──▶ RUNNING
//!     │             │             │
//!     │             ▼             ▼
//!     └──────▶ TERMINATED ◀── TERMINATING
//! ```
//!
//! `PREPARING → TERMINATED` covers failed creation (nothing persisted);
//! every other path to `TERMINATED` passes through `TERMINATING` so that
//! teardown (session close, grant release) is never skipped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::resource::ResourceGrant;

/// Nanoseconds since the unix epoch.
#[must_use]
pub fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Stable identifier of a logical compute session. Survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelId(String);

impl KernelId {
    /// Generates a fresh random kernel id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("k-{}", Uuid::new_v4()))
    }

    /// Returns the id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for KernelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the container currently realizing a kernel. Changes on
/// every restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Wraps a runtime-issued container id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One bind mount carried by a kernel's container realization.
///
/// Stored on the kernel so a restart can rebuild the container spec exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host-side path.
    pub host_path: PathBuf,
    /// In-container path.
    pub container_path: PathBuf,
    /// Whether the mount is read-only inside the container.
    pub read_only: bool,
}

/// One published service port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host-visible port drawn from the agent's port pool.
    pub host_port: u16,
    /// Port the service listens on inside the container.
    pub container_port: u16,
}

/// Lifecycle state of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelState {
    /// Creation in progress; resources may be partially acquired.
    Preparing,
    /// Container up, executions admitted.
    Running,
    /// Container being replaced; logical session preserved.
    Restarting,
    /// Teardown in progress.
    Terminating,
    /// Gone. Terminal.
    Terminated,
}

impl KernelState {
    /// Whether the state machine permits moving to `next` from here.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Preparing, Self::Running)
                | (Self::Preparing, Self::Terminated)
                | (Self::Running, Self::Restarting)
                | (Self::Running, Self::Terminating)
                | (Self::Restarting, Self::Running)
                | (Self::Restarting, Self::Terminating)
                | (Self::Terminating, Self::Terminated)
        )
    }

    /// Whether the kernel is on its way out (or gone).
    #[must_use]
    pub const fn is_closing(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }
}

impl std::fmt::Display for KernelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        write!(f, "{name}")
    }
}

/// One logical compute session.
#[derive(Debug, Clone)]
pub struct Kernel {
    /// Stable id, preserved across restarts.
    pub id: KernelId,
    /// Current container realizing this kernel.
    pub container_id: ContainerId,
    /// Image reference the container was created from.
    pub image: String,
    /// Lifecycle state.
    pub state: KernelState,
    /// Resources held by this kernel. Released exactly once, at teardown.
    pub grant: ResourceGrant,
    /// Working volume preserved across restarts.
    pub scratch_dir: PathBuf,
    /// Bind mounts, kept for restart's container rebuild.
    pub mounts: Vec<MountSpec>,
    /// Published service ports, stable across restarts.
    pub service_ports: Vec<PortBinding>,
    /// Creation time, unix nanoseconds.
    pub created_at_ns: u64,
    /// Last completed restart, unix nanoseconds.
    pub last_restarted_at_ns: Option<u64>,
    /// Last admission or lifecycle touch; drives idle reaping.
    pub last_used_ns: u64,
    /// Automatic restarts consumed from the per-kernel budget.
    pub auto_restarts_used: u32,
}

/// Registry operation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// A kernel with this id is already registered.
    #[error("duplicate kernel id {kernel_id}")]
    Duplicate {
        /// The colliding id.
        kernel_id: KernelId,
    },

    /// No kernel with this id is registered.
    #[error("unknown kernel {kernel_id}")]
    Unknown {
        /// The missing id.
        kernel_id: KernelId,
    },

    /// The requested state change is not a legal edge of the machine.
    #[error("kernel {kernel_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// The kernel.
        kernel_id: KernelId,
        /// Current state.
        from: KernelState,
        /// Requested state.
        to: KernelState,
    },
}

/// Shared kernel_id → [`Kernel`] map.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    entries: RwLock<HashMap<KernelId, Arc<RwLock<Kernel>>>>,
}

impl KernelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new kernel.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the id is taken.
    pub fn insert(&self, kernel: Kernel) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().expect("lock poisoned");
        if entries.contains_key(&kernel.id) {
            return Err(RegistryError::Duplicate {
                kernel_id: kernel.id,
            });
        }
        entries.insert(kernel.id.clone(), Arc::new(RwLock::new(kernel)));
        Ok(())
    }

    /// Removes a kernel, returning its final snapshot.
    pub fn remove(&self, kernel_id: &KernelId) -> Option<Kernel> {
        let mut entries = self.entries.write().expect("lock poisoned");
        entries
            .remove(kernel_id)
            .map(|entry| entry.read().expect("lock poisoned").clone())
    }

    /// Snapshot of one kernel.
    #[must_use]
    pub fn get(&self, kernel_id: &KernelId) -> Option<Kernel> {
        let entries = self.entries.read().expect("lock poisoned");
        entries
            .get(kernel_id)
            .map(|entry| entry.read().expect("lock poisoned").clone())
    }

    /// Current state of one kernel.
    #[must_use]
    pub fn state(&self, kernel_id: &KernelId) -> Option<KernelState> {
        self.get(kernel_id).map(|kernel| kernel.state)
    }

    /// Validated state transition. Returns the previous state.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unknown`] or
    /// [`RegistryError::InvalidTransition`].
    pub fn transition(
        &self,
        kernel_id: &KernelId,
        to: KernelState,
    ) -> Result<KernelState, RegistryError> {
        let entries = self.entries.read().expect("lock poisoned");
        let entry = entries.get(kernel_id).ok_or_else(|| RegistryError::Unknown {
            kernel_id: kernel_id.clone(),
        })?;
        let mut kernel = entry.write().expect("lock poisoned");
        let from = kernel.state;
        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                kernel_id: kernel_id.clone(),
                from,
                to,
            });
        }
        kernel.state = to;
        Ok(from)
    }

    /// Applies a closure to one kernel entry under its write lock.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unknown`] if the kernel is not registered.
    pub fn update<F>(&self, kernel_id: &KernelId, mutate: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Kernel),
    {
        let entries = self.entries.read().expect("lock poisoned");
        let entry = entries.get(kernel_id).ok_or_else(|| RegistryError::Unknown {
            kernel_id: kernel_id.clone(),
        })?;
        let mut kernel = entry.write().expect("lock poisoned");
        mutate(&mut kernel);
        Ok(())
    }

    /// Marks the kernel as used now (idle-reaper input). Unknown ids are
    /// ignored.
    pub fn touch(&self, kernel_id: &KernelId) {
        let now = unix_now_ns();
        let _ = self.update(kernel_id, |kernel| kernel.last_used_ns = now);
    }

    /// Reverse lookup by container id.
    #[must_use]
    pub fn find_by_container(&self, container_id: &ContainerId) -> Option<KernelId> {
        let entries = self.entries.read().expect("lock poisoned");
        entries.values().find_map(|entry| {
            let kernel = entry.read().expect("lock poisoned");
            (kernel.container_id == *container_id).then(|| kernel.id.clone())
        })
    }

    /// Number of registered kernels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all registered kernels.
    #[must_use]
    pub fn kernel_ids(&self) -> Vec<KernelId> {
        let entries = self.entries.read().expect("lock poisoned");
        entries.keys().cloned().collect()
    }

    /// Snapshot of every registered kernel.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Kernel> {
        let entries = self.entries.read().expect("lock poisoned");
        entries
            .values()
            .map(|entry| entry.read().expect("lock poisoned").clone())
            .collect()
    }
}
