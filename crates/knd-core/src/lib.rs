//! Core types and accounting for the knd node agent.
//!
//! This crate holds the pieces of the agent that are pure bookkeeping: the
//! error taxonomy surfaced to callers, agent configuration, the partitionable
//! resource pools (CPU cores, accelerator shares, host ports), and the kernel
//! registry with its lifecycle state machine. Nothing here performs I/O; the
//! async daemon built on top lives in `knd-daemon`.
//!
//! # Modules
//!
//! - [`error`]: typed failures returned by every agent operation
//! - [`config`]: agent configuration, deserializable from a YAML snapshot
//! - [`resource`]: grant/release accounting for cores, accelerators, ports
//! - [`registry`]: kernel registry and state machine
//! - [`ring_buffer`]: bounded FIFO retention buffer

pub mod config;
pub mod error;
pub mod registry;
pub mod resource;
pub mod ring_buffer;

pub use config::AgentConfig;
pub use error::AgentError;
pub use registry::{
    ContainerId, Kernel, KernelId, KernelRegistry, KernelState, MountSpec, PortBinding,
};
pub use resource::{ResourceAllocator, ResourceGrant, ResourceRequest};
