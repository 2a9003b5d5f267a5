//! Container runtime contract.
//!
//! The agent never talks to a concrete container engine directly; everything
//! goes through [`ContainerRuntime`], an abstract async contract the
//! deployment wires to its engine of choice. This keeps the core testable
//! against a scripted runtime and keeps vendor details (registry auth,
//! socket transport) outside the agent.
//!
//! Every call the daemon makes through this trait is wrapped in a bounded
//! deadline by [`with_deadline`]: a call past its deadline counts as a
//! failed runtime operation, never as success.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use knd_core::error::AgentError;
use knd_core::registry::{ContainerId, MountSpec, PortBinding};

/// Failure reported by a container runtime implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The referenced container does not exist (anymore).
    #[error("container not found: {container_id}")]
    NotFound {
        /// The missing container.
        container_id: String,
    },

    /// The referenced image is not available to the runtime.
    #[error("image not found: {reference}")]
    ImageNotFound {
        /// The missing image reference.
        reference: String,
    },

    /// The runtime daemon itself is unreachable or refused the call.
    #[error("runtime unavailable: {reason}")]
    Unavailable {
        /// Transport-level description.
        reason: String,
    },

    /// The call reached the runtime and failed there.
    #[error("runtime operation failed: {reason}")]
    Failed {
        /// Engine-reported description.
        reason: String,
    },
}

/// Everything needed to realize one kernel container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference to create from.
    pub image: String,
    /// Deterministic container name (`kernel.<kernel_id>`); used for
    /// best-effort cleanup when creation times out before an id is known.
    pub name: String,
    /// Exclusive CPU affinity set from the kernel's grant.
    pub cpuset: BTreeSet<u32>,
    /// Environment injected into the container.
    pub env: BTreeMap<String, String>,
    /// Bind mounts (scratch dirs, user volumes).
    pub mounts: Vec<MountSpec>,
    /// Host-to-container service port mappings.
    pub port_bindings: Vec<PortBinding>,
    /// Opaque accelerator arguments produced by the grant's plugins.
    pub accelerator_args: BTreeMap<String, String>,
}

/// Point-in-time resource counters for one container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Cumulative CPU time, nanoseconds.
    pub cpu_total_ns: u64,
    /// Resident memory, bytes.
    pub mem_bytes: u64,
    /// Cumulative block I/O read, bytes.
    pub io_read_bytes: u64,
    /// Cumulative block I/O written, bytes.
    pub io_write_bytes: u64,
}

/// Locally available image as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    /// Image reference (name:tag).
    pub reference: String,
    /// Content digest, when the runtime reports one.
    pub digest: Option<String>,
}

/// One event from the runtime's event feed.
///
/// The feed may redeliver events (the monitoring connection's own
/// timeout/reconnect cycle does this); `(container_id, kind, timestamp_ns)`
/// is the idempotency key consumers deduplicate on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeEvent {
    /// The container the event concerns.
    pub container_id: ContainerId,
    /// What happened.
    pub kind: RuntimeEventKind,
    /// Runtime-reported event time, unix nanoseconds.
    pub timestamp_ns: u64,
}

/// Event kinds the agent cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RuntimeEventKind {
    /// Container was created.
    Created,
    /// Container started.
    Started,
    /// Container exited (crash or completion) with the given code.
    Died {
        /// Process exit code as reported by the runtime.
        exit_code: i32,
    },
}

/// Input half of the execution channel: frames flowing toward the kernel.
#[async_trait]
pub trait ExecInput: Send {
    /// Sends one frame toward the kernel.
    async fn send(&mut self, frame: Bytes) -> Result<(), RuntimeError>;
}

/// Output half of the execution channel: frames flowing back from the
/// kernel. `Ok(None)` means the flow ended (container gone or channel torn
/// down).
#[async_trait]
pub trait ExecOutput: Send {
    /// Receives the next frame from the kernel.
    async fn recv(&mut self) -> Result<Option<Bytes>, RuntimeError>;
}

/// Message-oriented duplex channel to a running kernel.
///
/// Two independent directional flows (conceptually a PUSH/PULL socket pair)
/// rather than request/response: input frames flow one way, output frames
/// the other, so partial output and interactive input never block on a
/// single round trip. Frame payloads are opaque bytes; the execution
/// engine owns the framing.
pub struct ExecChannel {
    /// Agent → kernel flow.
    pub input: Box<dyn ExecInput>,
    /// Kernel → agent flow.
    pub output: Box<dyn ExecOutput>,
}

/// Abstract container runtime client.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a container from the spec, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError>;

    /// Starts a created container.
    async fn start_container(&self, container_id: &ContainerId) -> Result<(), RuntimeError>;

    /// Stops a running container. Stopping an already-dead container is not
    /// an error.
    async fn stop_container(&self, container_id: &ContainerId) -> Result<(), RuntimeError>;

    /// Removes a container. Implementations accept the deterministic
    /// container *name* as well as the id, so a timed-out create can still
    /// be cleaned up.
    async fn remove_container(&self, container_id: &ContainerId) -> Result<(), RuntimeError>;

    /// Lists ids of containers currently known to the runtime.
    async fn list_containers(&self) -> Result<Vec<ContainerId>, RuntimeError>;

    /// Pulls an image from its registry.
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// Lists locally available images.
    async fn list_local_images(&self) -> Result<Vec<ImageSummary>, RuntimeError>;

    /// Samples resource counters for one container.
    async fn container_stats(&self, container_id: &ContainerId)
        -> Result<ContainerStats, RuntimeError>;

    /// Opens the duplex execution channel to a container.
    async fn open_exec_stream(
        &self,
        container_id: &ContainerId,
    ) -> Result<ExecChannel, RuntimeError>;

    /// Subscribes to the runtime event feed. Each call opens a fresh
    /// subscription; the receiver ends when the feed connection drops, and
    /// the consumer resubscribes.
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<RuntimeEvent>, RuntimeError>;
}

/// Runs a runtime call under a bounded deadline.
///
/// Expiry and runtime failure both surface as
/// [`AgentError::RuntimeOperationFailed`] naming the operation; callers
/// decide whether to retry. A timeout is never treated as success.
pub(crate) async fn with_deadline<T, F>(
    operation: &str,
    deadline: Duration,
    call: F,
) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(AgentError::RuntimeOperationFailed {
            operation: operation.to_string(),
            reason: err.to_string(),
        }),
        Err(_) => Err(AgentError::RuntimeOperationFailed {
            operation: operation.to_string(),
            reason: format!("deadline exceeded after {deadline:?}"),
        }),
    }
}
