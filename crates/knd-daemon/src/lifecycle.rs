//! Kernel lifecycle management.
//!
//! Owns kernel creation, restart, and destruction, consulting the image
//! manager and resource allocator and driving the registry's state machine.
//! Every operation on one kernel runs under that kernel's operation lock;
//! operations on different kernels proceed concurrently.
//!
//! # Unwind discipline
//!
//! Creation acquires, in order: image, resource grant, scratch directory,
//! registry entry, container. Any failure unwinds every prior acquisition
//! before the error surfaces — a failed create leaves no grant, no
//! container, no registry entry behind. A container-create that times out
//! is followed by a best-effort stop/remove using the deterministic
//! container name, so a late-arriving container cannot squat on a grant
//! the registry never recorded.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use knd_core::config::AgentConfig;
use knd_core::error::AgentError;
use knd_core::registry::{
    unix_now_ns, ContainerId, Kernel, KernelId, KernelRegistry, KernelState, MountSpec,
    PortBinding,
};
use knd_core::resource::{ResourceAllocator, ResourceGrant, ResourceRequest};

use crate::exec::ExecutionProtocolEngine;
use crate::image::ImageManager;
use crate::locks::KernelLocks;
use crate::runtime::{with_deadline, ContainerRuntime, ContainerSpec};

/// Manager-bound event emitted by the lifecycle layer. The external RPC
/// layer forwards these upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentNotification {
    /// Kernel creation started.
    KernelCreating {
        /// The kernel being created.
        kernel_id: KernelId,
    },
    /// Kernel came back up with a new container.
    KernelRestarted {
        /// The restarted kernel.
        kernel_id: KernelId,
    },
    /// Kernel is gone; emitted exactly once per kernel.
    KernelTerminated {
        /// The terminated kernel.
        kernel_id: KernelId,
        /// Why (`user-requested`, `unsolicited-exit`,
        /// `auto-restart-exhausted`, `restart-failed`, `idle-timeout`,
        /// `agent-termination`).
        reason: String,
    },
}

/// Everything a create call provides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelCreateSpec {
    /// Image reference to run.
    pub image: String,
    /// Requested resources.
    pub resources: ResourceRequest,
    /// User bind mounts.
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// In-container service ports to publish; each gets a host port from
    /// the pool.
    #[serde(default)]
    pub service_container_ports: Vec<u16>,
}

/// Creates, restarts, and destroys kernel containers.
pub struct KernelLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    images: Arc<ImageManager>,
    allocator: Arc<ResourceAllocator>,
    registry: Arc<KernelRegistry>,
    engine: Arc<ExecutionProtocolEngine>,
    locks: Arc<KernelLocks>,
    config: Arc<AgentConfig>,
    notifications: mpsc::UnboundedSender<AgentNotification>,
}

impl KernelLifecycleManager {
    /// Wires the manager to its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        images: Arc<ImageManager>,
        allocator: Arc<ResourceAllocator>,
        registry: Arc<KernelRegistry>,
        engine: Arc<ExecutionProtocolEngine>,
        locks: Arc<KernelLocks>,
        config: Arc<AgentConfig>,
        notifications: mpsc::UnboundedSender<AgentNotification>,
    ) -> Self {
        Self {
            runtime,
            images,
            allocator,
            registry,
            engine,
            locks,
            config,
            notifications,
        }
    }

    /// Creates a kernel: image, grant, scratch, container, registry entry.
    ///
    /// # Errors
    ///
    /// [`AgentError::ImageUnavailable`] when the image cannot be pulled,
    /// [`AgentError::InsufficientResources`] when the grant cannot be
    /// satisfied, [`AgentError::RuntimeOperationFailed`] when a runtime
    /// call fails or times out. No partial state survives an error.
    pub async fn create(&self, spec: KernelCreateSpec) -> Result<KernelId, AgentError> {
        let kernel_id = KernelId::generate();
        self.notify(AgentNotification::KernelCreating {
            kernel_id: kernel_id.clone(),
        });

        self.images.ensure(&spec.image).await?;

        let mut request = spec.resources.clone();
        request.port_count = spec.service_container_ports.len();
        let grant = self.allocator.allocate(&request)?;

        let scratch_dir = self.config.scratch_root.join(kernel_id.as_str());
        if let Err(err) = prepare_scratch(&scratch_dir).await {
            self.allocator.release(&grant);
            return Err(err);
        }

        let service_ports: Vec<PortBinding> = grant
            .host_ports
            .iter()
            .zip(&spec.service_container_ports)
            .map(|(&host_port, &container_port)| PortBinding {
                host_port,
                container_port,
            })
            .collect();

        let now = unix_now_ns();
        let kernel = Kernel {
            id: kernel_id.clone(),
            container_id: ContainerId::new(""),
            image: spec.image.clone(),
            state: KernelState::Preparing,
            grant: grant.clone(),
            scratch_dir: scratch_dir.clone(),
            mounts: spec.mounts.clone(),
            service_ports: service_ports.clone(),
            created_at_ns: now,
            last_restarted_at_ns: None,
            last_used_ns: now,
            auto_restarts_used: 0,
        };
        if let Err(err) = self.registry.insert(kernel) {
            self.allocator.release(&grant);
            remove_scratch(&scratch_dir).await;
            return Err(AgentError::InvalidRequest {
                reason: err.to_string(),
            });
        }

        let lock = self.locks.for_kernel(&kernel_id);
        let _guard = lock.lock().await;

        let container_spec = build_container_spec(
            &kernel_id,
            &spec.image,
            &grant,
            &spec.mounts,
            &service_ports,
            &scratch_dir,
        );
        match self.realize_container(&container_spec).await {
            Ok(container_id) => {
                let _ = self.registry.update(&kernel_id, |kernel| {
                    kernel.container_id = container_id.clone();
                });
                self.registry
                    .transition(&kernel_id, KernelState::Running)
                    .map_err(|err| AgentError::RuntimeOperationFailed {
                        operation: "register_kernel".into(),
                        reason: err.to_string(),
                    })?;
                info!(kernel = %kernel_id, image = %spec.image, container = %container_id, "kernel created");
                Ok(kernel_id)
            }
            Err(err) => {
                self.unwind_failed_create(&kernel_id, &scratch_dir).await;
                Err(err)
            }
        }
    }

    /// Restarts a kernel: same logical session, new container.
    ///
    /// The working volume, resource grant, and published host ports are
    /// preserved; the container (and any execution channel to it) is
    /// replaced. A restart requested while one is already in flight is
    /// rejected, not queued.
    ///
    /// # Errors
    ///
    /// [`AgentError::InvalidRequest`] for unknown kernels or an in-flight
    /// restart, [`AgentError::SessionClosed`] for closing kernels,
    /// [`AgentError::RuntimeOperationFailed`] when the replacement
    /// container cannot be realized (the kernel is then terminated and its
    /// resources released).
    pub async fn restart(&self, kernel_id: &KernelId) -> Result<(), AgentError> {
        match self.registry.state(kernel_id) {
            None => {
                return Err(AgentError::InvalidRequest {
                    reason: format!("unknown kernel {kernel_id}"),
                })
            }
            Some(KernelState::Restarting) => {
                return Err(AgentError::InvalidRequest {
                    reason: format!("restart already in progress for kernel {kernel_id}"),
                })
            }
            Some(state) if state.is_closing() => {
                return Err(AgentError::SessionClosed {
                    kernel_id: kernel_id.to_string(),
                })
            }
            Some(_) => {}
        }

        let lock = self.locks.for_kernel(kernel_id);
        let _guard = lock.lock().await;

        let kernel = self
            .registry
            .get(kernel_id)
            .ok_or_else(|| AgentError::SessionClosed {
                kernel_id: kernel_id.to_string(),
            })?;
        if kernel.state != KernelState::Running {
            return Err(AgentError::SessionClosed {
                kernel_id: kernel_id.to_string(),
            });
        }
        self.restart_locked(&kernel).await
    }

    /// Destroys a kernel. Idempotent: unknown or already-terminated kernels
    /// are a no-op, never an error, and the grant is released exactly once.
    ///
    /// # Errors
    ///
    /// None in practice; the signature leaves room for future fatal
    /// conditions.
    pub async fn destroy(&self, kernel_id: &KernelId) -> Result<(), AgentError> {
        self.destroy_with_reason(kernel_id, "user-requested").await
    }

    /// [`Self::destroy`] with an explicit termination reason for the
    /// manager-bound notification.
    pub async fn destroy_with_reason(
        &self,
        kernel_id: &KernelId,
        reason: &str,
    ) -> Result<(), AgentError> {
        if self.registry.get(kernel_id).is_none() {
            debug!(kernel = %kernel_id, "destroy of unknown kernel, no-op");
            return Ok(());
        }

        let lock = self.locks.for_kernel(kernel_id);
        let _guard = lock.lock().await;

        let Some(kernel) = self.registry.get(kernel_id) else {
            return Ok(());
        };
        if kernel.state.is_closing() {
            return Ok(());
        }
        if self
            .registry
            .transition(kernel_id, KernelState::Terminating)
            .is_err()
        {
            return Ok(());
        }

        self.engine.fail_all(
            kernel_id,
            &AgentError::SessionClosed {
                kernel_id: kernel_id.to_string(),
            },
        );
        self.teardown_container(&kernel.container_id).await;
        self.finalize_termination(kernel_id, reason).await;
        Ok(())
    }

    /// Destroys every registered kernel concurrently (agent reset and
    /// shutdown).
    pub async fn destroy_all(&self, reason: &str) {
        let kernel_ids = self.registry.kernel_ids();
        if kernel_ids.is_empty() {
            return;
        }
        info!(count = kernel_ids.len(), reason, "destroying all kernels");
        let destroys = kernel_ids
            .iter()
            .map(|kernel_id| self.destroy_with_reason(kernel_id, reason));
        for result in futures::future::join_all(destroys).await {
            if let Err(err) = result {
                warn!(error = %err, "destroy during {reason} failed");
            }
        }
    }

    /// Reacts to a container that exited without a lifecycle operation in
    /// flight: restart within the per-kernel budget, terminate otherwise.
    /// Called by the event monitor; failures surface once as a
    /// [`AgentNotification::KernelTerminated`].
    pub async fn handle_unsolicited_exit(&self, container_id: &ContainerId, exit_code: i32) {
        let Some(kernel_id) = self.registry.find_by_container(container_id) else {
            debug!(container = %container_id, "exit event for unregistered container");
            return;
        };

        let lock = self.locks.for_kernel(&kernel_id);
        let _guard = lock.lock().await;

        // Re-check under the lock: a restart or destroy may have won.
        let Some(kernel) = self.registry.get(&kernel_id) else {
            return;
        };
        if kernel.container_id != *container_id || kernel.state != KernelState::Running {
            return;
        }

        warn!(kernel = %kernel_id, container = %container_id, exit_code, "container exited unsolicited");
        let policy = self.config.restart;
        if policy.auto_restart && kernel.auto_restarts_used < policy.max_auto_restarts {
            let _ = self.registry.update(&kernel_id, |kernel| {
                kernel.auto_restarts_used += 1;
            });
            let Some(kernel) = self.registry.get(&kernel_id) else {
                return;
            };
            info!(
                kernel = %kernel_id,
                attempt = kernel.auto_restarts_used,
                budget = policy.max_auto_restarts,
                "attempting automatic restart"
            );
            if let Err(err) = self.restart_locked(&kernel).await {
                warn!(kernel = %kernel_id, error = %err, "automatic restart failed");
            }
        } else {
            let reason = if policy.auto_restart {
                "auto-restart-exhausted"
            } else {
                "unsolicited-exit"
            };
            self.engine.fail_all(
                &kernel_id,
                &AgentError::SessionClosed {
                    kernel_id: kernel_id.to_string(),
                },
            );
            let _ = self.registry.transition(&kernel_id, KernelState::Terminating);
            self.teardown_container(&kernel.container_id).await;
            self.finalize_termination(&kernel_id, reason).await;
        }
    }

    /// Destroys kernels unused for longer than `idle_timeout`.
    pub async fn reap_idle(&self, idle_timeout: Duration) {
        let cutoff = unix_now_ns().saturating_sub(
            u64::try_from(idle_timeout.as_nanos()).unwrap_or(u64::MAX),
        );
        let stale: Vec<KernelId> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|kernel| kernel.state == KernelState::Running && kernel.last_used_ns < cutoff)
            .map(|kernel| kernel.id)
            .collect();
        for kernel_id in stale {
            info!(kernel = %kernel_id, "destroying idle kernel");
            let _ = self.destroy_with_reason(&kernel_id, "idle-timeout").await;
        }
    }

    /// Restart body; caller holds the kernel's operation lock and has
    /// verified the kernel is `RUNNING`.
    async fn restart_locked(&self, kernel: &Kernel) -> Result<(), AgentError> {
        let kernel_id = &kernel.id;
        self.registry
            .transition(kernel_id, KernelState::Restarting)
            .map_err(|err| AgentError::RuntimeOperationFailed {
                operation: "restart".into(),
                reason: err.to_string(),
            })?;

        // Channels to the old container are invalid from here on; pending
        // work is failed, never silently dropped.
        self.engine.fail_all(
            kernel_id,
            &AgentError::SessionClosed {
                kernel_id: kernel_id.to_string(),
            },
        );
        self.teardown_container(&kernel.container_id).await;

        let container_spec = build_container_spec(
            kernel_id,
            &kernel.image,
            &kernel.grant,
            &kernel.mounts,
            &kernel.service_ports,
            &kernel.scratch_dir,
        );
        match self.realize_container(&container_spec).await {
            Ok(container_id) => {
                let now = unix_now_ns();
                let _ = self.registry.update(kernel_id, |kernel| {
                    kernel.container_id = container_id.clone();
                    kernel.last_restarted_at_ns = Some(now);
                    kernel.last_used_ns = now;
                });
                self.registry
                    .transition(kernel_id, KernelState::Running)
                    .map_err(|err| AgentError::RuntimeOperationFailed {
                        operation: "restart".into(),
                        reason: err.to_string(),
                    })?;
                self.engine.reopen(kernel_id);
                info!(kernel = %kernel_id, container = %container_id, "kernel restarted");
                self.notify(AgentNotification::KernelRestarted {
                    kernel_id: kernel_id.clone(),
                });
                Ok(())
            }
            Err(err) => {
                warn!(kernel = %kernel_id, error = %err, "restart failed, terminating kernel");
                let _ = self
                    .registry
                    .transition(kernel_id, KernelState::Terminating);
                self.finalize_termination(kernel_id, "restart-failed").await;
                Err(err)
            }
        }
    }

    /// Creates and starts a container, cleaning up best-effort on failure.
    async fn realize_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<ContainerId, AgentError> {
        let deadline = self.config.timeouts.runtime_op();
        let container_id = match with_deadline(
            "create_container",
            deadline,
            self.runtime.create_container(spec),
        )
        .await
        {
            Ok(container_id) => container_id,
            Err(err) => {
                // The create may have gone through after the deadline; a
                // leaked container must not squat on the grant.
                let by_name = ContainerId::new(spec.name.clone());
                self.teardown_container(&by_name).await;
                return Err(err);
            }
        };

        if let Err(err) = with_deadline(
            "start_container",
            deadline,
            self.runtime.start_container(&container_id),
        )
        .await
        {
            self.teardown_container(&container_id).await;
            return Err(err);
        }
        Ok(container_id)
    }

    /// Best-effort stop + remove; errors are logged, not surfaced. The
    /// container may already be dead or gone.
    async fn teardown_container(&self, container_id: &ContainerId) {
        if container_id.as_str().is_empty() {
            return;
        }
        let deadline = self.config.timeouts.runtime_op();
        if let Err(err) = with_deadline(
            "stop_container",
            deadline,
            self.runtime.stop_container(container_id),
        )
        .await
        {
            debug!(container = %container_id, error = %err, "stop during teardown failed");
        }
        if let Err(err) = with_deadline(
            "remove_container",
            deadline,
            self.runtime.remove_container(container_id),
        )
        .await
        {
            debug!(container = %container_id, error = %err, "remove during teardown failed");
        }
    }

    /// Walks the kernel to `TERMINATED`, releases everything it held, and
    /// emits the single terminated notification. Caller holds the kernel's
    /// operation lock and has already dealt with the container.
    async fn finalize_termination(&self, kernel_id: &KernelId, reason: &str) {
        self.engine.fail_all(
            kernel_id,
            &AgentError::SessionClosed {
                kernel_id: kernel_id.to_string(),
            },
        );
        self.engine.remove_session(kernel_id);
        let _ = self.registry.transition(kernel_id, KernelState::Terminated);
        if let Some(kernel) = self.registry.remove(kernel_id) {
            self.allocator.release(&kernel.grant);
            remove_scratch(&kernel.scratch_dir).await;
        }
        self.locks.remove(kernel_id);
        info!(kernel = %kernel_id, reason, "kernel terminated");
        self.notify(AgentNotification::KernelTerminated {
            kernel_id: kernel_id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Unwind for a create that failed after the registry entry existed.
    async fn unwind_failed_create(&self, kernel_id: &KernelId, scratch_dir: &Path) {
        let _ = self.registry.transition(kernel_id, KernelState::Terminated);
        if let Some(kernel) = self.registry.remove(kernel_id) {
            self.allocator.release(&kernel.grant);
        }
        remove_scratch(scratch_dir).await;
        self.locks.remove(kernel_id);
        debug!(kernel = %kernel_id, "failed create unwound");
    }

    fn notify(&self, notification: AgentNotification) {
        let _ = self.notifications.send(notification);
    }
}

/// Builds the container spec realizing a kernel's grant: exclusive cpuset,
/// a core-count env var reflecting the enforced affinity set (so in-kernel
/// core queries see the granted set, not the host total), accelerator
/// share arguments, intrinsic scratch mounts, and service port bindings.
fn build_container_spec(
    kernel_id: &KernelId,
    image: &str,
    grant: &ResourceGrant,
    mounts: &[MountSpec],
    service_ports: &[PortBinding],
    scratch_dir: &Path,
) -> ContainerSpec {
    let mut env = BTreeMap::new();
    env.insert("KND_KERNEL_ID".to_string(), kernel_id.to_string());
    env.insert(
        "KND_CPU_COUNT".to_string(),
        grant.cpu_set.len().to_string(),
    );

    let mut accelerator_args = BTreeMap::new();
    for reservation in &grant.accelerators {
        let shares = reservation
            .device_units
            .iter()
            .map(|(device, units)| format!("{device}={units}"))
            .collect::<Vec<_>>()
            .join(",");
        accelerator_args.insert(
            format!("{}_SHARES", reservation.plugin_id.to_uppercase()),
            shares,
        );
    }

    let mut all_mounts = vec![
        MountSpec {
            host_path: scratch_dir.join("config"),
            container_path: "/home/config".into(),
            read_only: true,
        },
        MountSpec {
            host_path: scratch_dir.join("work"),
            container_path: "/home/work".into(),
            read_only: false,
        },
    ];
    all_mounts.extend(mounts.iter().cloned());

    ContainerSpec {
        image: image.to_string(),
        name: format!("kernel.{kernel_id}"),
        cpuset: grant.cpu_set.clone(),
        env,
        mounts: all_mounts,
        port_bindings: service_ports.to_vec(),
        accelerator_args,
    }
}

async fn prepare_scratch(scratch_dir: &Path) -> Result<(), AgentError> {
    for dir in [
        scratch_dir.join("config"),
        scratch_dir.join("work"),
        scratch_dir.join("work/.output"),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| AgentError::RuntimeOperationFailed {
                operation: "prepare_scratch".into(),
                reason: format!("{}: {err}", dir.display()),
            })?;
    }
    Ok(())
}

async fn remove_scratch(scratch_dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(scratch_dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!(dir = %scratch_dir.display(), error = %err, "scratch removal failed");
        }
    }
}
