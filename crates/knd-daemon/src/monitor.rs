//! Container runtime event monitoring.
//!
//! Consumes the runtime's event feed continuously, resubscribing when the
//! feed connection drops. The feed may redeliver events across its own
//! timeout/reconnect cycle, so every event is deduplicated through a
//! bounded already-seen window keyed by `(container, kind, timestamp)`:
//! re-delivery of an applied event is a no-op.
//!
//! Reconnect-and-resume is best effort; the worst-case gap is closed by a
//! periodic reconciliation sweep that compares the registry's expected
//! running containers against the runtime's actual list and treats a
//! registered-but-missing container as an unsolicited exit.
//!
//! Redelivery and reconnects are handled entirely here; nothing of it is
//! ever surfaced to callers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use knd_core::registry::{ContainerId, KernelRegistry, KernelState};
use knd_core::ring_buffer::RingBuffer;

use crate::lifecycle::KernelLifecycleManager;
use crate::runtime::{with_deadline, ContainerRuntime, RuntimeEvent, RuntimeEventKind};

/// How many event keys the dedup window retains.
const SEEN_WINDOW_CAPACITY: usize = 4096;

/// Backoff before retrying a failed feed subscription.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Exit code reported when reconciliation finds a container gone without a
/// delivered exit event.
const EXIT_CODE_UNKNOWN: i32 = -1;

type EventKey = (ContainerId, RuntimeEventKind, u64);

/// Bounded already-seen set: a lookup set plus a FIFO retention window so
/// memory stays constant under any event volume.
struct SeenWindow {
    keys: HashSet<EventKey>,
    order: RingBuffer<EventKey>,
}

impl SeenWindow {
    fn new(capacity: usize) -> Self {
        Self {
            keys: HashSet::with_capacity(capacity),
            order: RingBuffer::new(capacity),
        }
    }

    /// Records the key. Returns `false` when it was already present
    /// (duplicate delivery).
    fn insert(&mut self, key: EventKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if let Some(evicted) = self.order.push(key.clone()) {
            self.keys.remove(&evicted);
        }
        self.keys.insert(key)
    }
}

/// Watches the runtime event feed and drives registry transitions for
/// unsolicited container exits.
pub struct EventMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<KernelRegistry>,
    lifecycle: Arc<KernelLifecycleManager>,
    seen: Mutex<SeenWindow>,
    deadline: Duration,
}

impl EventMonitor {
    /// Wires the monitor to its collaborators.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<KernelRegistry>,
        lifecycle: Arc<KernelLifecycleManager>,
        deadline: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            lifecycle,
            seen: Mutex::new(SeenWindow::new(SEEN_WINDOW_CAPACITY)),
            deadline,
        }
    }

    /// Applies one event. Duplicates (same container, kind, and timestamp)
    /// are no-ops.
    pub async fn handle_event(&self, event: RuntimeEvent) {
        let key = (event.container_id.clone(), event.kind, event.timestamp_ns);
        let fresh = {
            let mut seen = self.seen.lock().expect("lock poisoned");
            seen.insert(key)
        };
        if !fresh {
            debug!(container = %event.container_id, "duplicate event ignored");
            return;
        }

        if let RuntimeEventKind::Died { exit_code } = event.kind {
            self.lifecycle
                .handle_unsolicited_exit(&event.container_id, exit_code)
                .await;
        }
    }

    /// Consumes the event feed until shutdown, resubscribing whenever the
    /// feed ends or the subscription fails.
    pub async fn run_event_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.runtime.subscribe_events().await {
                Ok(mut events) => loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        event = events.recv() => match event {
                            Some(event) => self.handle_event(event).await,
                            None => {
                                info!("event feed ended, resubscribing");
                                break;
                            }
                        },
                    }
                },
                Err(err) => {
                    warn!(error = %err, "event feed subscription failed, retrying");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        () = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// One reconciliation sweep: any `RUNNING` kernel whose container the
    /// runtime no longer lists is treated as an unsolicited exit.
    pub async fn reconcile(&self) {
        let listed = match with_deadline(
            "list_containers",
            self.deadline,
            self.runtime.list_containers(),
        )
        .await
        {
            Ok(containers) => containers.into_iter().collect::<HashSet<ContainerId>>(),
            Err(err) => {
                warn!(error = %err, "reconciliation sweep skipped");
                return;
            }
        };

        for kernel in self.registry.snapshot() {
            if kernel.state == KernelState::Running && !listed.contains(&kernel.container_id) {
                warn!(
                    kernel = %kernel.id,
                    container = %kernel.container_id,
                    "registered container missing from runtime"
                );
                self.lifecycle
                    .handle_unsolicited_exit(&kernel.container_id, EXIT_CODE_UNKNOWN)
                    .await;
            }
        }
    }

    /// Runs reconciliation sweeps on a fixed cadence until shutdown.
    pub async fn run_reconcile_loop(
        &self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.reconcile().await,
            }
        }
    }
}
