//! Mock container runtime for controlled E2E testing.
//!
//! Unlike a real runtime client that talks to an engine daemon,
//! `MockRuntime` simulates container behavior deterministically: tests
//! script image availability, failure injection, event delivery, and drive
//! each opened execution channel by hand through a [`MockExecHandle`].

// Not every test file uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use knd_core::config::AgentConfig;
use knd_core::registry::ContainerId;
use knd_daemon::exec::frame::{AgentFrame, KernelFrame};
use knd_daemon::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStats, ExecChannel, ExecInput, ExecOutput,
    ImageSummary, RuntimeError, RuntimeEvent, RuntimeEventKind,
};
use knd_daemon::upload::{ObjectStorageUploader, UploadError};
use tokio::sync::mpsc;

// =============================================================================
// MockRuntime
// =============================================================================

#[derive(Debug, Clone)]
struct MockContainer {
    spec_name: String,
    running: bool,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    images: Vec<ImageSummary>,
    next_container: u64,
    pulls: HashMap<String, u64>,
    created_specs: Vec<ContainerSpec>,
}

/// Handle to one opened execution channel: read what the engine sent, feed
/// frames back.
pub struct MockExecHandle {
    /// Frames the engine sent toward the kernel.
    pub sent: mpsc::UnboundedReceiver<Bytes>,
    /// Feed output frames back to the engine. Dropping this ends the
    /// output flow (the engine sees a lost stream).
    pub reply: mpsc::UnboundedSender<Bytes>,
}

impl MockExecHandle {
    /// Waits for the next kernel-bound frame and decodes it.
    pub async fn next_kernel_frame(&mut self) -> KernelFrame {
        let payload = tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("timed out waiting for kernel frame")
            .expect("input flow closed");
        serde_json::from_slice(&payload).expect("kernel frame decodes")
    }

    /// Sends a well-formed output frame to the engine.
    pub fn send_frame(&self, frame: &AgentFrame) {
        let payload = Bytes::from(serde_json::to_vec(frame).expect("frame encodes"));
        let _ = self.reply.send(payload);
    }

    /// Sends raw bytes (for malformed-frame tests).
    pub fn send_raw(&self, payload: &'static [u8]) {
        let _ = self.reply.send(Bytes::from_static(payload));
    }
}

struct MockExecInput {
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl ExecInput for MockExecInput {
    async fn send(&mut self, frame: Bytes) -> Result<(), RuntimeError> {
        self.tx.send(frame).map_err(|_| RuntimeError::Unavailable {
            reason: "exec input closed".into(),
        })
    }
}

struct MockExecOutput {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl ExecOutput for MockExecOutput {
    async fn recv(&mut self) -> Result<Option<Bytes>, RuntimeError> {
        Ok(self.rx.recv().await)
    }
}

/// Scripted, deterministic container runtime.
pub struct MockRuntime {
    state: Mutex<MockState>,
    event_feeds: Mutex<Vec<mpsc::Sender<RuntimeEvent>>>,
    exec_handles_tx: mpsc::UnboundedSender<MockExecHandle>,
    exec_handles_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockExecHandle>>,
    /// Fail the next (and all further) `create_container` calls.
    pub fail_create: AtomicBool,
    /// Fail the next (and all further) `start_container` calls.
    pub fail_start: AtomicBool,
    /// Fail all `pull_image` calls.
    pub fail_pull: AtomicBool,
    /// Delay applied inside `pull_image`, for overlap tests.
    pub pull_delay_ms: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        let (exec_handles_tx, exec_handles_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            event_feeds: Mutex::new(Vec::new()),
            exec_handles_tx,
            exec_handles_rx: tokio::sync::Mutex::new(exec_handles_rx),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_pull: AtomicBool::new(false),
            pull_delay_ms: AtomicU64::new(0),
        })
    }

    /// Marks an image as locally available.
    pub fn add_local_image(&self, reference: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.images.push(ImageSummary {
            reference: reference.to_string(),
            digest: Some(format!("sha256:{reference}")),
        });
    }

    /// Times `pull_image` was called for a reference.
    pub fn pull_count(&self, reference: &str) -> u64 {
        let state = self.state.lock().expect("lock poisoned");
        state.pulls.get(reference).copied().unwrap_or(0)
    }

    /// Ids of containers currently running.
    pub fn running_containers(&self) -> Vec<String> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .containers
            .iter()
            .filter(|(_, container)| container.running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Specs of every container ever created, in creation order.
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        let state = self.state.lock().expect("lock poisoned");
        state.created_specs.clone()
    }

    /// Removes a container without delivering any event (simulates the
    /// worst-case gap the reconciliation sweep must close).
    pub fn kill_silently(&self, container_id: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.containers.remove(container_id);
    }

    /// Containers known to the runtime, running or not.
    pub fn container_count(&self) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state.containers.len()
    }

    /// Live event feed subscriptions.
    pub fn event_feed_count(&self) -> usize {
        let feeds = self.event_feeds.lock().expect("lock poisoned");
        feeds.len()
    }

    /// Delivers an event to every live feed subscription.
    pub async fn emit_event(&self, event: RuntimeEvent) {
        let feeds = {
            let feeds = self.event_feeds.lock().expect("lock poisoned");
            feeds.clone()
        };
        for feed in feeds {
            let _ = feed.send(event.clone()).await;
        }
    }

    /// Convenience: a `Died` event for a container.
    pub async fn emit_died(&self, container_id: &str, exit_code: i32, timestamp_ns: u64) {
        self.emit_event(RuntimeEvent {
            container_id: ContainerId::new(container_id),
            kind: RuntimeEventKind::Died { exit_code },
            timestamp_ns,
        })
        .await;
    }

    /// Ends all current feed subscriptions (forces resubscribe).
    pub fn drop_event_feeds(&self) {
        let mut feeds = self.event_feeds.lock().expect("lock poisoned");
        feeds.clear();
    }

    /// Waits for the engine to open the next execution channel.
    pub async fn next_exec_handle(&self) -> MockExecHandle {
        let mut rx = self.exec_handles_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for exec channel")
            .expect("exec handle channel closed")
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed {
                reason: "injected create failure".into(),
            });
        }
        let mut state = self.state.lock().expect("lock poisoned");
        state.next_container += 1;
        let id = format!("mc-{}", state.next_container);
        state.containers.insert(
            id.clone(),
            MockContainer {
                spec_name: spec.name.clone(),
                running: false,
            },
        );
        state.created_specs.push(spec.clone());
        Ok(ContainerId::new(id))
    }

    async fn start_container(&self, container_id: &ContainerId) -> Result<(), RuntimeError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed {
                reason: "injected start failure".into(),
            });
        }
        let mut state = self.state.lock().expect("lock poisoned");
        match state.containers.get_mut(container_id.as_str()) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound {
                container_id: container_id.to_string(),
            }),
        }
    }

    async fn stop_container(&self, container_id: &ContainerId) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(container) = state.containers.get_mut(container_id.as_str()) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &ContainerId) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("lock poisoned");
        // Accept the deterministic name as well as the id.
        let by_id = state.containers.remove(container_id.as_str());
        if by_id.is_none() {
            let name = container_id.as_str().to_string();
            state
                .containers
                .retain(|_, container| container.spec_name != name);
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerId>, RuntimeError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .containers
            .iter()
            .filter(|(_, container)| container.running)
            .map(|(id, _)| ContainerId::new(id.clone()))
            .collect())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            *state.pulls.entry(reference.to_string()).or_insert(0) += 1;
        }
        let delay = self.pull_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(RuntimeError::ImageNotFound {
                reference: reference.to_string(),
            });
        }
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.images.iter().any(|image| image.reference == reference) {
            state.images.push(ImageSummary {
                reference: reference.to_string(),
                digest: Some(format!("sha256:{reference}")),
            });
        }
        Ok(())
    }

    async fn list_local_images(&self) -> Result<Vec<ImageSummary>, RuntimeError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.images.clone())
    }

    async fn container_stats(
        &self,
        container_id: &ContainerId,
    ) -> Result<ContainerStats, RuntimeError> {
        let state = self.state.lock().expect("lock poisoned");
        if state.containers.contains_key(container_id.as_str()) {
            Ok(ContainerStats {
                cpu_total_ns: 1_000_000,
                mem_bytes: 64 * 1024 * 1024,
                io_read_bytes: 4096,
                io_write_bytes: 2048,
            })
        } else {
            Err(RuntimeError::NotFound {
                container_id: container_id.to_string(),
            })
        }
    }

    async fn open_exec_stream(
        &self,
        container_id: &ContainerId,
    ) -> Result<ExecChannel, RuntimeError> {
        {
            let state = self.state.lock().expect("lock poisoned");
            let running = state
                .containers
                .get(container_id.as_str())
                .is_some_and(|container| container.running);
            if !running {
                return Err(RuntimeError::NotFound {
                    container_id: container_id.to_string(),
                });
            }
        }
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let _ = self.exec_handles_tx.send(MockExecHandle {
            sent: input_rx,
            reply: output_tx,
        });
        Ok(ExecChannel {
            input: Box::new(MockExecInput { tx: input_tx }),
            output: Box::new(MockExecOutput { rx: output_rx }),
        })
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<RuntimeEvent>, RuntimeError> {
        let (tx, rx) = mpsc::channel(64);
        let mut feeds = self.event_feeds.lock().expect("lock poisoned");
        feeds.push(tx);
        Ok(rx)
    }
}

// =============================================================================
// MockUploader
// =============================================================================

/// Records uploads and returns deterministic external references.
#[derive(Default)]
pub struct MockUploader {
    uploaded: Mutex<Vec<PathBuf>>,
    /// Fail all uploads.
    pub fail: AtomicBool,
}

impl MockUploader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn uploaded(&self) -> Vec<PathBuf> {
        self.uploaded.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl ObjectStorageUploader for MockUploader {
    async fn upload(&self, local_path: &Path) -> Result<String, UploadError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(UploadError::Failed {
                reason: "injected upload failure".into(),
            });
        }
        let mut uploaded = self.uploaded.lock().expect("lock poisoned");
        uploaded.push(local_path.to_path_buf());
        let name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("ext://artifacts/{name}"))
    }
}

// =============================================================================
// Config and polling helpers
// =============================================================================

/// Agent config suitable for tests: scratch under a tempdir, short timers.
pub fn test_config(scratch_root: &Path) -> AgentConfig {
    let yaml = format!(
        r#"
scratch_root: {}
resources:
  cpu_cores: [0, 1, 2, 3, 4, 5]
  max_cores_per_kernel: 4
  accelerators:
    - plugin_id: cuda
      devices: 2
ports:
  start: 30000
  end: 30015
timeouts:
  runtime_op_ms: 2000
  restart_settle_ms: 2000
intervals:
  stats_sample_ms: 100
  reconcile_ms: 200
"#,
        scratch_root.display()
    );
    AgentConfig::from_yaml(&yaml).expect("test config parses")
}

/// Polls `condition` until it holds or the timeout elapses.
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
