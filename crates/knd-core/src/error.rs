//! Agent-wide error taxonomy.
//!
//! Every lifecycle and execution operation returns either a success value or
//! exactly one of these failures. Recoverable conditions (resource pressure)
//! are distinguished from runtime faults so the manager can decide between
//! retry, backoff, and rejection.

use thiserror::Error;

/// Typed failure surfaced by agent operations.
///
/// Variants map one-to-one onto caller-visible failure classes; internal
/// conditions (event redelivery, monitor reconnects, restart retries below
/// the budget) are never surfaced through this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// The allocation cannot be satisfied right now. Recoverable: the caller
    /// may retry later or reject the originating request.
    #[error("insufficient resources: {reason}")]
    InsufficientResources {
        /// What ran out (cores, accelerator shares, host ports).
        reason: String,
    },

    /// The image is missing locally and the pull failed. No partial kernel
    /// is created.
    #[error("image unavailable: {reference}: {reason}")]
    ImageUnavailable {
        /// The requested image reference.
        reference: String,
        /// Why the pull failed.
        reason: String,
    },

    /// A container-runtime call errored or exceeded its deadline. Partially
    /// acquired resources have already been unwound when this surfaces.
    #[error("runtime operation '{operation}' failed: {reason}")]
    RuntimeOperationFailed {
        /// The runtime call that failed (create, start, stop, ...).
        operation: String,
        /// The underlying failure description.
        reason: String,
    },

    /// The target kernel is terminating or terminated. All queued and active
    /// executions fail this way during teardown.
    #[error("session closed for kernel {kernel_id}")]
    SessionClosed {
        /// The kernel whose session is gone.
        kernel_id: String,
    },

    /// The duplex execution channel broke while a request was active. The
    /// request is failed rather than left pending.
    #[error("execution stream lost for kernel {kernel_id}: {reason}")]
    StreamLost {
        /// The kernel whose stream broke.
        kernel_id: String,
        /// What was observed (EOF, send failure, container restart).
        reason: String,
    },

    /// Malformed or out-of-order frames arrived on the execution channel.
    /// The offending execution fails; the kernel itself is kept.
    #[error("protocol violation on execution channel: {reason}")]
    ProtocolViolation {
        /// Description of the offending frame.
        reason: String,
    },

    /// The request failed admission-time validation (unknown kernel, batch
    /// staging limits exceeded, malformed payload).
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What was rejected.
        reason: String,
    },
}

impl AgentError {
    /// Returns `true` for failures the caller may reasonably retry after
    /// backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::InsufficientResources { .. })
    }
}
