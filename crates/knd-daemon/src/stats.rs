//! Per-kernel stats sampling and the heartbeat payload.
//!
//! A periodic loop samples resource counters for every running kernel and
//! retains the latest sample. The heartbeat accessor assembles a
//! point-in-time payload — available images, free/used resources, kernel
//! count, latest per-kernel counters — without blocking in-flight
//! mutations: it only takes short read locks on its own sample store and
//! the registry/allocator snapshots.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use knd_core::registry::{unix_now_ns, KernelId, KernelRegistry, KernelState};
use knd_core::resource::{ResourceAllocator, ResourceSnapshot};

use crate::image::ImageManager;
use crate::runtime::{with_deadline, ContainerRuntime, ContainerStats};

/// Latest counters sampled for one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelStatSnapshot {
    /// The kernel.
    pub kernel_id: KernelId,
    /// Container the counters were read from.
    pub container_id: String,
    /// Raw counters.
    pub stats: ContainerStats,
    /// Sample time, unix nanoseconds.
    pub sampled_at_ns: u64,
}

/// The periodic status payload the manager-facing RPC layer forwards as
/// the node's heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Assembly time, unix nanoseconds.
    pub timestamp_ns: u64,
    /// Locally available images.
    pub images: Vec<String>,
    /// Capacity view of the resource pools.
    pub resources: ResourceSnapshot,
    /// Registered kernels.
    pub kernel_count: usize,
    /// Latest per-kernel counters.
    pub kernels: Vec<KernelStatSnapshot>,
}

/// Samples per-kernel resource counters and assembles heartbeat payloads.
pub struct StatsCollector {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<KernelRegistry>,
    images: Arc<ImageManager>,
    allocator: Arc<ResourceAllocator>,
    latest: RwLock<HashMap<KernelId, KernelStatSnapshot>>,
    deadline: Duration,
}

impl StatsCollector {
    /// Wires the collector to its collaborators.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<KernelRegistry>,
        images: Arc<ImageManager>,
        allocator: Arc<ResourceAllocator>,
        deadline: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            images,
            allocator,
            latest: RwLock::new(HashMap::new()),
            deadline,
        }
    }

    /// Samples counters for every running kernel and drops samples of
    /// kernels that no longer exist. Per-container failures are skipped;
    /// the previous sample for that kernel is retained.
    pub async fn sample_all(&self) {
        let kernels = self.registry.snapshot();
        let mut fresh: Vec<KernelStatSnapshot> = Vec::new();
        for kernel in &kernels {
            if kernel.state != KernelState::Running {
                continue;
            }
            match with_deadline(
                "container_stats",
                self.deadline,
                self.runtime.container_stats(&kernel.container_id),
            )
            .await
            {
                Ok(stats) => fresh.push(KernelStatSnapshot {
                    kernel_id: kernel.id.clone(),
                    container_id: kernel.container_id.to_string(),
                    stats,
                    sampled_at_ns: unix_now_ns(),
                }),
                Err(err) => {
                    debug!(kernel = %kernel.id, error = %err, "stats sample skipped");
                }
            }
        }

        let registered: std::collections::HashSet<&KernelId> =
            kernels.iter().map(|kernel| &kernel.id).collect();
        let mut latest = self.latest.write().expect("lock poisoned");
        latest.retain(|kernel_id, _| registered.contains(kernel_id));
        for sample in fresh {
            latest.insert(sample.kernel_id.clone(), sample);
        }
    }

    /// Assembles the heartbeat payload from current snapshots. Never
    /// blocks on in-flight lifecycle or execution work.
    #[must_use]
    pub fn heartbeat_payload(&self) -> HeartbeatPayload {
        let kernels = {
            let latest = self.latest.read().expect("lock poisoned");
            let mut samples: Vec<KernelStatSnapshot> = latest.values().cloned().collect();
            samples.sort_by(|a, b| a.kernel_id.cmp(&b.kernel_id));
            samples
        };
        HeartbeatPayload {
            timestamp_ns: unix_now_ns(),
            images: self.images.local_references(),
            resources: self.allocator.snapshot(),
            kernel_count: self.registry.len(),
            kernels,
        }
    }

    /// Runs the sampling loop until shutdown.
    pub async fn run_sampling_loop(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.sample_all().await,
            }
        }
    }
}
