//! The agent facade.
//!
//! Wires the components together, runs the background loops (event
//! monitoring, reconciliation, stats sampling, idle reaping), and exposes
//! the typed operations the external RPC layer dispatches into:
//! create / restart / destroy / execute / cancel / reset, plus the
//! non-blocking heartbeat accessor and the notification stream.
//!
//! The RPC transport itself is not here; deployments embed this library
//! and bridge their transport to these methods.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use knd_core::config::AgentConfig;
use knd_core::error::AgentError;
use knd_core::registry::{Kernel, KernelId, KernelRegistry};
use knd_core::resource::ResourceAllocator;

use crate::exec::{ExecutionOutcome, ExecutionPayload, ExecutionProtocolEngine};
use crate::image::ImageManager;
use crate::lifecycle::{AgentNotification, KernelCreateSpec, KernelLifecycleManager};
use crate::locks::KernelLocks;
use crate::monitor::EventMonitor;
use crate::runtime::ContainerRuntime;
use crate::stats::{HeartbeatPayload, StatsCollector};
use crate::upload::ObjectStorageUploader;

/// One node agent instance.
pub struct Agent {
    config: Arc<AgentConfig>,
    registry: Arc<KernelRegistry>,
    images: Arc<ImageManager>,
    engine: Arc<ExecutionProtocolEngine>,
    lifecycle: Arc<KernelLifecycleManager>,
    monitor: Arc<EventMonitor>,
    stats: Arc<StatsCollector>,
    shutdown_tx: watch::Sender<bool>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<AgentNotification>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Builds an agent over the given runtime and optional artifact
    /// uploader. Call [`Agent::start`] to launch the background loops.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        uploader: Option<Arc<dyn ObjectStorageUploader>>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(KernelRegistry::new());
        let allocator = Arc::new(ResourceAllocator::from_config(
            &config.resources,
            &config.ports,
        ));
        let locks = Arc::new(KernelLocks::new());
        let images = Arc::new(ImageManager::new(
            Arc::clone(&runtime),
            config.timeouts.runtime_op(),
        ));
        let engine = Arc::new(ExecutionProtocolEngine::new(
            Arc::clone(&runtime),
            Arc::clone(&registry),
            Arc::clone(&locks),
            uploader,
            &config,
        ));
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(KernelLifecycleManager::new(
            Arc::clone(&runtime),
            Arc::clone(&images),
            Arc::clone(&allocator),
            Arc::clone(&registry),
            Arc::clone(&engine),
            Arc::clone(&locks),
            Arc::clone(&config),
            notifications_tx,
        ));
        let monitor = Arc::new(EventMonitor::new(
            Arc::clone(&runtime),
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            config.timeouts.runtime_op(),
        ));
        let stats = Arc::new(StatsCollector::new(
            Arc::clone(&runtime),
            Arc::clone(&registry),
            Arc::clone(&images),
            Arc::clone(&allocator),
            config.timeouts.runtime_op(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            registry,
            images,
            engine,
            lifecycle,
            monitor,
            stats,
            shutdown_tx,
            notifications: Mutex::new(Some(notifications_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Primes the image cache and launches the background loops.
    pub async fn start(self: &Arc<Self>) {
        if let Err(err) = self.images.refresh().await {
            warn!(error = %err, "initial image scan failed");
        }

        let mut tasks = self.tasks.lock().expect("lock poisoned");

        let monitor = Arc::clone(&self.monitor);
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            monitor.run_event_loop(shutdown).await;
        }));

        let monitor = Arc::clone(&self.monitor);
        let shutdown = self.shutdown_tx.subscribe();
        let reconcile_period = self.config.intervals.reconcile();
        tasks.push(tokio::spawn(async move {
            monitor.run_reconcile_loop(reconcile_period, shutdown).await;
        }));

        let stats = Arc::clone(&self.stats);
        let shutdown = self.shutdown_tx.subscribe();
        let sample_period = self.config.intervals.stats_sample();
        tasks.push(tokio::spawn(async move {
            stats.run_sampling_loop(sample_period, shutdown).await;
        }));

        if let Some(idle_timeout) = self.config.intervals.idle_timeout() {
            let lifecycle = Arc::clone(&self.lifecycle);
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = self.config.intervals.reconcile();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = ticker.tick() => lifecycle.reap_idle(idle_timeout).await,
                    }
                }
            }));
        }

        info!("agent started");
    }

    /// Creates a kernel.
    ///
    /// # Errors
    ///
    /// See [`KernelLifecycleManager::create`].
    pub async fn create_kernel(&self, spec: KernelCreateSpec) -> Result<KernelId, AgentError> {
        self.lifecycle.create(spec).await
    }

    /// Restarts a kernel in place: same logical session, new container.
    ///
    /// # Errors
    ///
    /// See [`KernelLifecycleManager::restart`].
    pub async fn restart_kernel(&self, kernel_id: &KernelId) -> Result<(), AgentError> {
        self.lifecycle.restart(kernel_id).await
    }

    /// Destroys a kernel. Idempotent.
    ///
    /// # Errors
    ///
    /// See [`KernelLifecycleManager::destroy`].
    pub async fn destroy_kernel(&self, kernel_id: &KernelId) -> Result<(), AgentError> {
        self.lifecycle.destroy(kernel_id).await
    }

    /// Admits an execution request and waits for its completion.
    ///
    /// # Errors
    ///
    /// See [`ExecutionProtocolEngine::submit`].
    pub async fn execute(
        &self,
        kernel_id: &KernelId,
        run_id: Option<String>,
        payload: ExecutionPayload,
    ) -> Result<ExecutionOutcome, AgentError> {
        self.engine.submit(kernel_id, run_id, payload).await
    }

    /// Cancels a queued or active run.
    ///
    /// # Errors
    ///
    /// See [`ExecutionProtocolEngine::cancel`].
    pub fn cancel(&self, kernel_id: &KernelId, run_id: &str) -> Result<(), AgentError> {
        self.engine.cancel(kernel_id, run_id)
    }

    /// Feeds interactive stdin to a kernel's active run.
    ///
    /// # Errors
    ///
    /// See [`ExecutionProtocolEngine::feed_input`].
    pub fn feed_input(&self, kernel_id: &KernelId, text: impl Into<String>) -> Result<(), AgentError> {
        self.engine.feed_input(kernel_id, text)
    }

    /// Destroys every kernel (manager-requested node reset).
    pub async fn reset(&self) {
        self.lifecycle.destroy_all("agent-reset").await;
    }

    /// Point-in-time heartbeat payload; safe to call from the RPC layer's
    /// timer without blocking in-flight mutations.
    #[must_use]
    pub fn heartbeat_payload(&self) -> HeartbeatPayload {
        self.stats.heartbeat_payload()
    }

    /// Snapshot of one kernel's registry entry.
    #[must_use]
    pub fn kernel(&self, kernel_id: &KernelId) -> Option<Kernel> {
        self.registry.get(kernel_id)
    }

    /// Number of execution requests queued behind a kernel's active run.
    #[must_use]
    pub fn queue_depth(&self, kernel_id: &KernelId) -> usize {
        self.engine.queue_depth(kernel_id)
    }

    /// Takes the manager-bound notification stream. Yields `None` after
    /// the first call.
    #[must_use]
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<AgentNotification>> {
        self.notifications.lock().expect("lock poisoned").take()
    }

    /// Graceful shutdown: destroys all kernels, then stops the background
    /// loops.
    pub async fn shutdown(&self) {
        info!("agent shutting down");
        self.lifecycle.destroy_all("agent-termination").await;
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("lock poisoned"));
        for task in tasks {
            if task.await.is_err() {
                warn!("background task ended abnormally");
            }
        }
    }
}
