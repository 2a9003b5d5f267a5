//! Execution channel wire frames.
//!
//! Two independent directional flows multiplexed over one logical session:
//! [`KernelFrame`]s carry code, interactive input, and interrupts toward
//! the kernel; [`AgentFrame`]s carry console chunks, record events, and the
//! terminal completion markers back. Frames are JSON-encoded tagged values
//! over message-oriented byte payloads.
//!
//! A malformed inbound payload is a protocol violation: it fails the
//! offending execution, never the kernel.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use knd_core::error::AgentError;

/// How an execution request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Code snippet evaluated in the kernel's live session.
    Interactive,
    /// Staged input files, optional build step, then an exec command.
    Batch,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

/// Which console stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Frame sent from the agent toward the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelFrame {
    /// Begin an execution.
    Start {
        /// Client-visible run identifier.
        run_id: String,
        /// Interactive or batch.
        mode: ExecutionMode,
        /// Code to evaluate (interactive mode).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        /// Build command (batch mode, optional).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        build_cmd: Option<String>,
        /// Exec command (batch mode).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_cmd: Option<String>,
    },
    /// Interactive stdin for the running execution.
    Input {
        /// Text fed to the kernel's stdin.
        text: String,
    },
    /// Terminate the in-kernel process of the running execution.
    Interrupt,
}

/// Frame received from the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// A console output chunk.
    Console {
        /// Originating stream.
        stream: ConsoleStream,
        /// UTF-8 chunk.
        data: String,
    },
    /// A structured media/record event (plots, tables, rich output).
    Record {
        /// Opaque record payload forwarded to the client.
        payload: serde_json::Value,
    },
    /// Batch build phase finished; exec phase follows.
    BuildFinished {
        /// Build process exit code.
        exit_code: i32,
    },
    /// Execution finished. Terminal marker of the output flow.
    Finished {
        /// Last process's exit code.
        exit_code: i32,
    },
}

/// Encodes an outbound frame.
#[must_use]
pub fn encode_kernel_frame(frame: &KernelFrame) -> Bytes {
    Bytes::from(serde_json::to_vec(frame).expect("frame serialization is infallible"))
}

/// Decodes an inbound frame.
///
/// # Errors
///
/// Returns [`AgentError::ProtocolViolation`] for payloads that are not a
/// well-formed agent frame.
pub fn decode_agent_frame(payload: &Bytes) -> Result<AgentFrame, AgentError> {
    serde_json::from_slice(payload).map_err(|err| AgentError::ProtocolViolation {
        reason: format!("undecodable frame: {err}"),
    })
}
