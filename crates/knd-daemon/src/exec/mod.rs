//! Execution protocol engine.
//!
//! Per kernel, the engine maintains an ordered queue of execution requests
//! and exactly one active execution. Requests are admitted with a
//! monotonically increasing per-kernel ordering token and complete in
//! admission order (FIFO). Dispatch drives the duplex frame channel to the
//! container; loss of the channel mid-flight fails the active request with
//! a typed error instead of leaving the caller hanging.
//!
//! # Architecture
//!
//! ```text
//! ExecutionProtocolEngine
//!     |
//!     +-- sessions: kernel_id -> Session
//!     |       |
//!     |       +-- queue: VecDeque<Pending>      FIFO, ordering tokens
//!     |       +-- active: Option<Active>        at most one
//!     |       +-- closed: Option<AgentError>    teardown fan-out reason
//!     |
//!     +-- dispatch task (per active execution)
//!             |
//!             +-- open_exec_stream -> send Start -> frame loop -> outcome
//! ```
//!
//! # Invariants
//!
//! - Requests on one kernel complete in ordering-token order
//! - A new request never interleaves with the active one
//! - Teardown fails every queued and active request exactly once
//! - A malformed frame fails the execution, never the kernel

pub mod frame;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use knd_core::config::AgentConfig;
use knd_core::error::AgentError;
use knd_core::registry::{Kernel, KernelId, KernelRegistry, KernelState};

use crate::locks::KernelLocks;
use crate::runtime::{with_deadline, ContainerRuntime, ExecInput};
use crate::upload::ObjectStorageUploader;

pub use frame::{AgentFrame, ConsoleStream, ExecutionMode, KernelFrame};
use frame::{decode_agent_frame, encode_kernel_frame};

/// Relative path of the designated artifact directory inside the kernel's
/// working volume. Only files appearing here are auto-collected.
pub const OUTPUT_DIR_RELATIVE: &str = "work/.output";

/// One input file staged into the kernel's working directory before a batch
/// execution starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    /// Path relative to the working directory. Must not escape it.
    pub name: String,
    /// File contents.
    pub data: Vec<u8>,
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionPayload {
    /// Evaluate a code snippet in the kernel's live session.
    Interactive {
        /// The code to evaluate.
        code: String,
    },
    /// Stage inputs, optionally build, then run a command.
    Batch {
        /// Optional build command executed before `exec_cmd`.
        build_cmd: Option<String>,
        /// The command to execute.
        exec_cmd: String,
        /// Input files staged into the working directory first.
        #[serde(default)]
        input_files: Vec<StagedFile>,
    },
}

impl ExecutionPayload {
    /// The mode this payload runs in.
    #[must_use]
    pub const fn mode(&self) -> ExecutionMode {
        match self {
            Self::Interactive { .. } => ExecutionMode::Interactive,
            Self::Batch { .. } => ExecutionMode::Batch,
        }
    }
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The kernel reported the terminal marker.
    Finished {
        /// Last process's exit code.
        exit_code: i32,
    },
    /// Explicitly cancelled (active or queued).
    Cancelled,
    /// Exceeded the configured wall-clock ceiling and was interrupted.
    TimedOut,
}

/// One captured console chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleChunk {
    /// Originating stream.
    pub stream: ConsoleStream,
    /// UTF-8 chunk.
    pub data: String,
}

/// Reference to an uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// File name inside the output directory.
    pub name: String,
    /// External object-storage reference.
    pub external_ref: String,
}

/// Completed execution, successful or cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Client-visible run identifier.
    pub run_id: String,
    /// Admission-order token; completion order equals token order.
    pub ordering_token: u64,
    /// How the run ended.
    pub status: ExecutionStatus,
    /// Captured console output, in arrival order.
    pub console: Vec<ConsoleChunk>,
    /// Captured record events, in arrival order.
    pub records: Vec<serde_json::Value>,
    /// Build phase exit code (batch mode with a build command).
    pub build_exit_code: Option<i32>,
    /// Auto-collected artifacts from the output directory.
    pub artifacts: Vec<ArtifactRef>,
}

impl ExecutionOutcome {
    fn empty(run_id: String, ordering_token: u64, status: ExecutionStatus) -> Self {
        Self {
            run_id,
            ordering_token,
            status,
            console: Vec::new(),
            records: Vec::new(),
            build_exit_code: None,
            artifacts: Vec::new(),
        }
    }
}

type ExecResult = Result<ExecutionOutcome, AgentError>;

struct ExecItem {
    token: u64,
    run_id: String,
    payload: ExecutionPayload,
}

struct Pending {
    item: ExecItem,
    result_tx: oneshot::Sender<ExecResult>,
}

enum Control {
    /// Terminate the in-container process and complete as cancelled.
    Cancel,
    /// Interactive stdin for the active run.
    Input(String),
    /// Session teardown: complete with this error.
    Close(AgentError),
}

struct Active {
    run_id: String,
    control_tx: mpsc::UnboundedSender<Control>,
}

#[derive(Default)]
struct SessionInner {
    next_token: u64,
    queue: VecDeque<Pending>,
    active: Option<Active>,
    closed: Option<AgentError>,
}

/// Per-kernel execution session: the queue plus the active run.
struct Session {
    kernel_id: KernelId,
    inner: Mutex<SessionInner>,
}

/// Streams execution requests into running kernels, one kernel session at a
/// time, preserving admission order.
pub struct ExecutionProtocolEngine {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<KernelRegistry>,
    locks: Arc<KernelLocks>,
    uploader: Option<Arc<dyn ObjectStorageUploader>>,
    sessions: Mutex<HashMap<KernelId, Arc<Session>>>,
    runtime_op_deadline: Duration,
    restart_settle: Duration,
    exec_timeout: Option<Duration>,
    max_batch_files: usize,
    max_batch_file_bytes: u64,
    max_artifact_bytes: u64,
}

impl ExecutionProtocolEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<KernelRegistry>,
        locks: Arc<KernelLocks>,
        uploader: Option<Arc<dyn ObjectStorageUploader>>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            locks,
            uploader,
            sessions: Mutex::new(HashMap::new()),
            runtime_op_deadline: config.timeouts.runtime_op(),
            restart_settle: config.timeouts.restart_settle(),
            exec_timeout: config.exec.exec_timeout(),
            max_batch_files: config.exec.max_batch_files,
            max_batch_file_bytes: config.exec.max_batch_file_bytes,
            max_artifact_bytes: config.exec.max_artifact_bytes,
        }
    }

    /// Admits an execution request and waits for its completion.
    ///
    /// Admission assigns the next ordering token; the request is dispatched
    /// immediately when the session is idle, queued otherwise. Admission on
    /// a kernel mid-restart waits (bounded) for the restart to settle.
    ///
    /// # Errors
    ///
    /// [`AgentError::InvalidRequest`] for admission-time validation
    /// failures, [`AgentError::SessionClosed`] when the kernel is absent or
    /// closing, and the per-run failures documented on the frame loop
    /// ([`AgentError::StreamLost`], [`AgentError::ProtocolViolation`],
    /// [`AgentError::RuntimeOperationFailed`]).
    pub async fn submit(
        self: &Arc<Self>,
        kernel_id: &KernelId,
        run_id: Option<String>,
        payload: ExecutionPayload,
    ) -> ExecResult {
        self.validate(&payload)?;
        let run_id = run_id.unwrap_or_else(|| format!("run-{}", Uuid::new_v4()));

        // Ordered with lifecycle operations on the same kernel: admission
        // waits behind an in-flight restart and observes its outcome.
        let lock = self.locks.for_kernel(kernel_id);
        let guard = tokio::time::timeout(self.restart_settle, lock.lock())
            .await
            .map_err(|_| AgentError::RuntimeOperationFailed {
                operation: "execute_admission".into(),
                reason: format!(
                    "timed out after {:?} waiting for kernel {kernel_id} to settle",
                    self.restart_settle
                ),
            })?;

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

        let session = self.session(kernel_id);
        let result_rx = {
            let mut inner = session.inner.lock().expect("lock poisoned");
            if let Some(reason) = &inner.closed {
                return Err(reason.clone());
            }
            let token = inner.next_token;
            inner.next_token += 1;
            let (result_tx, result_rx) = oneshot::channel();
            let pending = Pending {
                item: ExecItem {
                    token,
                    run_id: run_id.clone(),
                    payload,
                },
                result_tx,
            };
            if inner.active.is_none() {
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                inner.active = Some(Active {
                    run_id: run_id.clone(),
                    control_tx,
                });
                self.spawn_dispatch(Arc::clone(&session), pending, control_rx);
            } else {
                debug!(kernel = %kernel_id, run = %run_id, token, "execution queued");
                inner.queue.push_back(pending);
            }
            result_rx
        };
        self.registry.touch(kernel_id);
        drop(guard);

        result_rx.await.map_err(|_| AgentError::StreamLost {
            kernel_id: kernel_id.to_string(),
            reason: "execution task dropped".into(),
        })?
    }

    /// Feeds interactive stdin to the kernel's active execution.
    ///
    /// # Errors
    ///
    /// [`AgentError::InvalidRequest`] when the kernel has no active
    /// execution.
    pub fn feed_input(&self, kernel_id: &KernelId, text: impl Into<String>) -> Result<(), AgentError> {
        let session = self
            .existing_session(kernel_id)
            .ok_or_else(|| AgentError::InvalidRequest {
                reason: format!("kernel {kernel_id} has no execution session"),
            })?;
        let inner = session.inner.lock().expect("lock poisoned");
        match &inner.active {
            Some(active) => {
                active
                    .control_tx
                    .send(Control::Input(text.into()))
                    .map_err(|_| AgentError::InvalidRequest {
                        reason: format!("kernel {kernel_id} has no active execution"),
                    })
            }
            None => Err(AgentError::InvalidRequest {
                reason: format!("kernel {kernel_id} has no active execution"),
            }),
        }
    }

    /// Cancels a run.
    ///
    /// Cancelling the active run terminates the in-container process and
    /// immediately dispatches the next queued request; cancelling a queued
    /// run removes it. Either way the run completes as
    /// [`ExecutionStatus::Cancelled`] toward its submitter.
    ///
    /// # Errors
    ///
    /// [`AgentError::InvalidRequest`] when no queued or active run matches.
    pub fn cancel(&self, kernel_id: &KernelId, run_id: &str) -> Result<(), AgentError> {
        let session = self
            .existing_session(kernel_id)
            .ok_or_else(|| AgentError::InvalidRequest {
                reason: format!("kernel {kernel_id} has no execution session"),
            })?;
        let mut inner = session.inner.lock().expect("lock poisoned");

        if let Some(active) = &inner.active {
            if active.run_id == run_id {
                let _ = active.control_tx.send(Control::Cancel);
                return Ok(());
            }
        }

        if let Some(position) = inner
            .queue
            .iter()
            .position(|pending| pending.item.run_id == run_id)
        {
            if let Some(pending) = inner.queue.remove(position) {
                let outcome = ExecutionOutcome::empty(
                    pending.item.run_id,
                    pending.item.token,
                    ExecutionStatus::Cancelled,
                );
                let _ = pending.result_tx.send(Ok(outcome));
            }
            return Ok(());
        }

        Err(AgentError::InvalidRequest {
            reason: format!("no run '{run_id}' queued or active on kernel {kernel_id}"),
        })
    }

    /// Number of requests queued behind the active one for a kernel.
    #[must_use]
    pub fn queue_depth(&self, kernel_id: &KernelId) -> usize {
        self.existing_session(kernel_id).map_or(0, |session| {
            session.inner.lock().expect("lock poisoned").queue.len()
        })
    }

    /// Fails every queued and active request of a kernel with `reason` and
    /// marks the session closed. Used by teardown and restart; each request
    /// is failed exactly once.
    pub fn fail_all(&self, kernel_id: &KernelId, reason: &AgentError) {
        let Some(session) = self.existing_session(kernel_id) else {
            return;
        };
        let mut inner = session.inner.lock().expect("lock poisoned");
        inner.closed = Some(reason.clone());
        while let Some(pending) = inner.queue.pop_front() {
            let _ = pending.result_tx.send(Err(reason.clone()));
        }
        if let Some(active) = &inner.active {
            let _ = active.control_tx.send(Control::Close(reason.clone()));
        }
    }

    /// Reopens a session after a completed restart. The ordering-token
    /// counter survives, so tokens stay monotonic for the kernel's whole
    /// logical lifetime.
    pub fn reopen(&self, kernel_id: &KernelId) {
        if let Some(session) = self.existing_session(kernel_id) {
            let mut inner = session.inner.lock().expect("lock poisoned");
            inner.closed = None;
        }
    }

    /// Drops a kernel's session entirely (kernel destroyed).
    pub fn remove_session(&self, kernel_id: &KernelId) {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        sessions.remove(kernel_id);
    }

    fn session(&self, kernel_id: &KernelId) -> Arc<Session> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        Arc::clone(sessions.entry(kernel_id.clone()).or_insert_with(|| {
            Arc::new(Session {
                kernel_id: kernel_id.clone(),
                inner: Mutex::new(SessionInner::default()),
            })
        }))
    }

    fn existing_session(&self, kernel_id: &KernelId) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().expect("lock poisoned");
        sessions.get(kernel_id).cloned()
    }

    fn validate(&self, payload: &ExecutionPayload) -> Result<(), AgentError> {
        let ExecutionPayload::Batch {
            exec_cmd,
            input_files,
            ..
        } = payload
        else {
            return Ok(());
        };
        if exec_cmd.trim().is_empty() {
            return Err(AgentError::InvalidRequest {
                reason: "batch exec_cmd must not be empty".into(),
            });
        }
        if input_files.len() > self.max_batch_files {
            return Err(AgentError::InvalidRequest {
                reason: format!(
                    "batch stages {} input files, limit is {}",
                    input_files.len(),
                    self.max_batch_files
                ),
            });
        }
        for file in input_files {
            if file.data.len() as u64 > self.max_batch_file_bytes {
                return Err(AgentError::InvalidRequest {
                    reason: format!(
                        "input file '{}' is {} bytes, limit is {}",
                        file.name,
                        file.data.len(),
                        self.max_batch_file_bytes
                    ),
                });
            }
            validate_staged_name(&file.name)?;
        }
        Ok(())
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        session: Arc<Session>,
        pending: Pending,
        control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let Pending { item, result_tx } = pending;
            let result = engine.run_one(&session.kernel_id, &item, control_rx).await;
            if let Err(err) = &result {
                debug!(kernel = %session.kernel_id, run = %item.run_id, error = %err, "execution failed");
            }
            let _ = result_tx.send(result);
            engine.advance(&session);
        });
    }

    /// Completes the active slot and dispatches the next queued request, if
    /// any. Teardown drains the queue through [`Self::fail_all`], so a
    /// closed session never dispatches again.
    fn advance(self: &Arc<Self>, session: &Arc<Session>) {
        let next = {
            let mut inner = session.inner.lock().expect("lock poisoned");
            inner.active = None;
            if inner.closed.is_some() {
                None
            } else if let Some(pending) = inner.queue.pop_front() {
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                inner.active = Some(Active {
                    run_id: pending.item.run_id.clone(),
                    control_tx,
                });
                Some((pending, control_rx))
            } else {
                None
            }
        };
        if let Some((pending, control_rx)) = next {
            self.spawn_dispatch(Arc::clone(session), pending, control_rx);
        }
    }

    /// Drives one execution end to end: stage, open stream, frame loop,
    /// artifact collection.
    async fn run_one(
        &self,
        kernel_id: &KernelId,
        item: &ExecItem,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) -> ExecResult {
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

        let is_batch = matches!(item.payload, ExecutionPayload::Batch { .. });
        let output_dir = kernel.scratch_dir.join(OUTPUT_DIR_RELATIVE);

        if let ExecutionPayload::Batch { input_files, .. } = &item.payload {
            stage_batch_files(&kernel, input_files).await?;
        }
        let initial_artifacts = if is_batch {
            scan_output_dir(&output_dir).await
        } else {
            HashMap::new()
        };

        let mut channel = with_deadline(
            "open_exec_stream",
            self.runtime_op_deadline,
            self.runtime.open_exec_stream(&kernel.container_id),
        )
        .await?;

        let start = match &item.payload {
            ExecutionPayload::Interactive { code } => KernelFrame::Start {
                run_id: item.run_id.clone(),
                mode: ExecutionMode::Interactive,
                code: Some(code.clone()),
                build_cmd: None,
                exec_cmd: None,
            },
            ExecutionPayload::Batch {
                build_cmd,
                exec_cmd,
                ..
            } => KernelFrame::Start {
                run_id: item.run_id.clone(),
                mode: ExecutionMode::Batch,
                code: None,
                build_cmd: build_cmd.clone(),
                exec_cmd: Some(exec_cmd.clone()),
            },
        };
        send_frame(&mut *channel.input, kernel_id, &start).await?;

        let mut console = Vec::new();
        let mut records = Vec::new();
        let mut build_exit_code = None;

        let exec_deadline = self.exec_timeout.map(|limit| tokio::time::Instant::now() + limit);
        let timeout = async move {
            match exec_deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let status = loop {
            tokio::select! {
                () = &mut timeout => {
                    let _ = channel.input.send(encode_kernel_frame(&KernelFrame::Interrupt)).await;
                    warn!(kernel = %kernel_id, run = %item.run_id, "execution exceeded wall-clock ceiling");
                    break ExecutionStatus::TimedOut;
                }
                control = control_rx.recv() => match control {
                    Some(Control::Cancel) => {
                        let _ = channel.input.send(encode_kernel_frame(&KernelFrame::Interrupt)).await;
                        break ExecutionStatus::Cancelled;
                    }
                    Some(Control::Input(text)) => {
                        send_frame(&mut *channel.input, kernel_id, &KernelFrame::Input { text }).await?;
                    }
                    Some(Control::Close(reason)) => return Err(reason),
                    None => {
                        return Err(AgentError::SessionClosed {
                            kernel_id: kernel_id.to_string(),
                        });
                    }
                },
                received = channel.output.recv() => match received {
                    Ok(Some(payload)) => match decode_agent_frame(&payload)? {
                        AgentFrame::Console { stream, data } => {
                            console.push(ConsoleChunk { stream, data });
                        }
                        AgentFrame::Record { payload } => records.push(payload),
                        AgentFrame::BuildFinished { exit_code } => {
                            if !is_batch {
                                return Err(AgentError::ProtocolViolation {
                                    reason: "build_finished outside batch mode".into(),
                                });
                            }
                            if build_exit_code.is_some() {
                                return Err(AgentError::ProtocolViolation {
                                    reason: "duplicate build_finished marker".into(),
                                });
                            }
                            build_exit_code = Some(exit_code);
                        }
                        AgentFrame::Finished { exit_code } => {
                            break ExecutionStatus::Finished { exit_code };
                        }
                    },
                    Ok(None) => {
                        return Err(AgentError::StreamLost {
                            kernel_id: kernel_id.to_string(),
                            reason: "output flow ended before the finished marker".into(),
                        });
                    }
                    Err(err) => {
                        return Err(AgentError::StreamLost {
                            kernel_id: kernel_id.to_string(),
                            reason: err.to_string(),
                        });
                    }
                },
            }
        };

        let artifacts = if is_batch && matches!(status, ExecutionStatus::Finished { .. }) {
            self.collect_artifacts(kernel_id, &output_dir, &initial_artifacts)
                .await
        } else {
            Vec::new()
        };

        self.registry.touch(kernel_id);
        Ok(ExecutionOutcome {
            run_id: item.run_id.clone(),
            ordering_token: item.token,
            status,
            console,
            records,
            build_exit_code,
            artifacts,
        })
    }

    /// Uploads files that appeared (or changed size) in the output
    /// directory during the run. Upload failures skip the file with a
    /// warning; they never fail an execution that already finished.
    async fn collect_artifacts(
        &self,
        kernel_id: &KernelId,
        output_dir: &Path,
        initial: &HashMap<String, u64>,
    ) -> Vec<ArtifactRef> {
        let Some(uploader) = &self.uploader else {
            return Vec::new();
        };
        let current = scan_output_dir(output_dir).await;
        let mut artifacts = Vec::new();
        let mut names: Vec<&String> = current.keys().collect();
        names.sort();
        for name in names {
            let size = current[name];
            if initial.get(name) == Some(&size) {
                continue;
            }
            if size > self.max_artifact_bytes {
                warn!(kernel = %kernel_id, file = %name, size, "artifact exceeds size limit, skipping");
                continue;
            }
            let path = output_dir.join(name);
            match uploader.upload(&path).await {
                Ok(external_ref) => artifacts.push(ArtifactRef {
                    name: name.clone(),
                    external_ref,
                }),
                Err(err) => {
                    warn!(kernel = %kernel_id, file = %name, error = %err, "artifact upload failed");
                }
            }
        }
        artifacts
    }
}

async fn send_frame(
    input: &mut dyn ExecInput,
    kernel_id: &KernelId,
    frame: &KernelFrame,
) -> Result<(), AgentError> {
    input
        .send(encode_kernel_frame(frame))
        .await
        .map_err(|err| AgentError::StreamLost {
            kernel_id: kernel_id.to_string(),
            reason: err.to_string(),
        })
}

/// Writes staged input files under the kernel's working directory.
async fn stage_batch_files(kernel: &Kernel, files: &[StagedFile]) -> Result<(), AgentError> {
    let work_dir = kernel.scratch_dir.join("work");
    for file in files {
        let dest: PathBuf = work_dir.join(&file.name);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| AgentError::RuntimeOperationFailed {
                    operation: "stage_input_files".into(),
                    reason: err.to_string(),
                })?;
        }
        tokio::fs::write(&dest, &file.data)
            .await
            .map_err(|err| AgentError::RuntimeOperationFailed {
                operation: "stage_input_files".into(),
                reason: err.to_string(),
            })?;
    }
    Ok(())
}

/// File name → size for the output directory. Missing directory reads as
/// empty.
async fn scan_output_dir(dir: &Path) -> HashMap<String, u64> {
    let mut sizes = HashMap::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return sizes;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(metadata) = entry.metadata().await {
            if metadata.is_file() {
                sizes.insert(entry.file_name().to_string_lossy().into_owned(), metadata.len());
            }
        }
    }
    sizes
}

/// Staged names stay inside the working directory: relative, no parent
/// traversal, no NUL.
fn validate_staged_name(name: &str) -> Result<(), AgentError> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.contains('\0')
        || Path::new(name)
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir));
    if invalid {
        return Err(AgentError::InvalidRequest {
            reason: format!("invalid staged file name '{name}'"),
        });
    }
    Ok(())
}
