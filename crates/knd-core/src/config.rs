//! Agent configuration.
//!
//! The agent consumes a read-only configuration snapshot (typically fetched
//! by the external bootstrap layer from the coordination store and handed
//! over as YAML). Everything here is plain data with conservative defaults;
//! validation happens in [`AgentConfig::validate`] so a bad snapshot is
//! rejected before any component starts.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default inclusive host port range published to kernels.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (30_000, 31_000);

/// Default hard ceiling of exclusive cores one kernel may hold, even when
/// more are free. Anti-monopolization policy, not a capacity statement.
pub const DEFAULT_MAX_CORES_PER_KERNEL: usize = 4;

/// Configuration load/validation error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The YAML snapshot could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The parsed snapshot is internally inconsistent.
    #[error("invalid config: {reason}")]
    Invalid {
        /// What failed validation.
        reason: String,
    },
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Root directory for per-kernel scratch (working volume) directories.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    /// Partitionable resource pools.
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Host port range published to kernel service ports.
    #[serde(default)]
    pub ports: PortRangeConfig,

    /// Automatic-restart policy for crashed kernels.
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Bounded deadlines for container-runtime calls.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Execution-protocol limits.
    #[serde(default)]
    pub exec: ExecConfig,

    /// Background task cadence.
    #[serde(default)]
    pub intervals: IntervalConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            resources: ResourceConfig::default(),
            ports: PortRangeConfig::default(),
            restart: RestartPolicy::default(),
            timeouts: TimeoutConfig::default(),
            exec: ExecConfig::default(),
            intervals: IntervalConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Parses a configuration snapshot from YAML and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the snapshot cannot be parsed or fails
    /// validation.
    pub fn from_yaml(snapshot: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(snapshot)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first inconsistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resources.cpu_cores.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "resources.cpu_cores must name at least one core".into(),
            });
        }
        if self.resources.max_cores_per_kernel == 0 {
            return Err(ConfigError::Invalid {
                reason: "resources.max_cores_per_kernel must be >= 1".into(),
            });
        }
        if self.ports.start > self.ports.end {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "ports.start ({}) must not exceed ports.end ({})",
                    self.ports.start, self.ports.end
                ),
            });
        }
        for accel in &self.resources.accelerators {
            if accel.devices == 0 {
                return Err(ConfigError::Invalid {
                    reason: format!("accelerator '{}' has zero devices", accel.plugin_id),
                });
            }
        }
        if self.exec.max_batch_files == 0 {
            return Err(ConfigError::Invalid {
                reason: "exec.max_batch_files must be >= 1".into(),
            });
        }
        Ok(())
    }
}

/// Partitionable resource pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// Host core ids this agent may hand out. The manager-side limit mask is
    /// applied before this snapshot is produced.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: Vec<u32>,

    /// Hard ceiling of cores per kernel, applied even when more are free.
    #[serde(default = "default_max_cores_per_kernel")]
    pub max_cores_per_kernel: usize,

    /// Accelerator pools, one entry per plugin.
    #[serde(default)]
    pub accelerators: Vec<AcceleratorConfig>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_cores: default_cpu_cores(),
            max_cores_per_kernel: default_max_cores_per_kernel(),
            accelerators: Vec::new(),
        }
    }
}

/// One accelerator pool managed by the stock fractional-share allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceleratorConfig {
    /// Plugin identifier referenced by resource requests (e.g. `"cuda"`).
    pub plugin_id: String,

    /// Number of physical devices in the pool.
    pub devices: u32,

    /// Share units per device. Defaults to 1000 (one unit = 1/1000 device).
    #[serde(default = "default_units_per_device")]
    pub units_per_device: u64,
}

/// Inclusive host port range for published kernel services.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRangeConfig {
    /// First usable port.
    #[serde(default = "default_port_start")]
    pub start: u16,
    /// Last usable port (inclusive).
    #[serde(default = "default_port_end")]
    pub end: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_RANGE.0,
            end: DEFAULT_PORT_RANGE.1,
        }
    }
}

/// Automatic-restart policy for kernels whose container exits unsolicited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartPolicy {
    /// Whether crashed kernels are automatically restarted at all.
    #[serde(default)]
    pub auto_restart: bool,

    /// Per-kernel budget of automatic restarts before the kernel is
    /// terminated for good.
    #[serde(default = "default_max_auto_restarts")]
    pub max_auto_restarts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: false,
            max_auto_restarts: default_max_auto_restarts(),
        }
    }
}

/// Deadlines for container-runtime calls. A call past its deadline counts as
/// a failed runtime operation, never as success.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Deadline for each individual runtime call, in milliseconds.
    #[serde(default = "default_runtime_op_ms")]
    pub runtime_op_ms: u64,

    /// How long execution admission waits for an in-flight restart to
    /// settle, in milliseconds.
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            runtime_op_ms: default_runtime_op_ms(),
            restart_settle_ms: default_restart_settle_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Per-call runtime deadline.
    #[must_use]
    pub const fn runtime_op(&self) -> Duration {
        Duration::from_millis(self.runtime_op_ms)
    }

    /// Restart-settle wait for execution admission.
    #[must_use]
    pub const fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

/// Execution-protocol limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecConfig {
    /// Maximum number of staged input files per batch request.
    #[serde(default = "default_max_batch_files")]
    pub max_batch_files: usize,

    /// Maximum size of a single staged input file, in bytes.
    #[serde(default = "default_max_batch_file_bytes")]
    pub max_batch_file_bytes: u64,

    /// Maximum size of a produced artifact eligible for auto-collection.
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,

    /// Wall-clock ceiling for one execution, in milliseconds. The run is
    /// interrupted and completed as timed out when exceeded. `None`
    /// disables the ceiling.
    #[serde(default)]
    pub exec_timeout_ms: Option<u64>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_batch_files: default_max_batch_files(),
            max_batch_file_bytes: default_max_batch_file_bytes(),
            max_artifact_bytes: default_max_artifact_bytes(),
            exec_timeout_ms: None,
        }
    }
}

impl ExecConfig {
    /// Per-execution wall-clock ceiling, if configured.
    #[must_use]
    pub fn exec_timeout(&self) -> Option<Duration> {
        self.exec_timeout_ms.map(Duration::from_millis)
    }
}

/// Background task cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntervalConfig {
    /// Stats sampling period, in milliseconds.
    #[serde(default = "default_stats_sample_ms")]
    pub stats_sample_ms: u64,

    /// Registry-vs-runtime reconciliation sweep period, in milliseconds.
    #[serde(default = "default_reconcile_ms")]
    pub reconcile_ms: u64,

    /// Destroy kernels unused for longer than this, in milliseconds.
    /// `None` disables idle reaping.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            stats_sample_ms: default_stats_sample_ms(),
            reconcile_ms: default_reconcile_ms(),
            idle_timeout_ms: None,
        }
    }
}

impl IntervalConfig {
    /// Stats sampling period.
    #[must_use]
    pub const fn stats_sample(&self) -> Duration {
        Duration::from_millis(self.stats_sample_ms)
    }

    /// Reconciliation sweep period.
    #[must_use]
    pub const fn reconcile(&self) -> Duration {
        Duration::from_millis(self.reconcile_ms)
    }

    /// Idle timeout, if idle reaping is enabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from("/var/cache/knd/scratches")
}

fn default_cpu_cores() -> Vec<u32> {
    (0..8).collect()
}

const fn default_max_cores_per_kernel() -> usize {
    DEFAULT_MAX_CORES_PER_KERNEL
}

const fn default_units_per_device() -> u64 {
    1000
}

const fn default_port_start() -> u16 {
    DEFAULT_PORT_RANGE.0
}

const fn default_port_end() -> u16 {
    DEFAULT_PORT_RANGE.1
}

const fn default_max_auto_restarts() -> u32 {
    3
}

const fn default_runtime_op_ms() -> u64 {
    30_000
}

const fn default_restart_settle_ms() -> u64 {
    60_000
}

const fn default_max_batch_files() -> usize {
    16
}

const fn default_max_batch_file_bytes() -> u64 {
    16 * 1024 * 1024
}

const fn default_max_artifact_bytes() -> u64 {
    100 * 1024 * 1024
}

const fn default_stats_sample_ms() -> u64 {
    5_000
}

const fn default_reconcile_ms() -> u64 {
    30_000
}
