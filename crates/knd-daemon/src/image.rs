//! Local image availability and on-demand pulls.
//!
//! The image manager answers "is this image here, and if not, get it" for
//! kernel creation, and exposes the locally available set for the
//! heartbeat. Pulls are deduplicated single-flight per reference: a second
//! `ensure` for an image already being pulled awaits the first pull instead
//! of starting another.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use knd_core::error::AgentError;

use crate::runtime::{with_deadline, ContainerRuntime};

/// Cached result of a local-availability check for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Image reference (name:tag).
    pub reference: String,
    /// Content digest, when known.
    pub digest: Option<String>,
    /// Whether the image is locally available.
    pub local: bool,
}

/// Ensures requested images are present locally, pulling on demand.
pub struct ImageManager {
    runtime: Arc<dyn ContainerRuntime>,
    deadline: Duration,
    records: RwLock<HashMap<String, ImageRecord>>,
    /// Per-reference pull guards; holding a guard means a presence check or
    /// pull for that reference is in flight.
    pull_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ImageManager {
    /// Creates a manager talking to the given runtime with the given
    /// per-call deadline.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, deadline: Duration) -> Self {
        Self {
            runtime,
            deadline,
            records: RwLock::new(HashMap::new()),
            pull_guards: Mutex::new(HashMap::new()),
        }
    }

    /// Makes sure `reference` is locally available, pulling if absent.
    ///
    /// Concurrent calls for the same reference trigger at most one pull.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ImageUnavailable`] when the image is absent
    /// and the pull fails (or times out); no partial state is recorded.
    pub async fn ensure(&self, reference: &str) -> Result<(), AgentError> {
        if self.is_cached_local(reference) {
            return Ok(());
        }

        let guard = {
            let mut guards = self.pull_guards.lock().await;
            Arc::clone(
                guards
                    .entry(reference.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _held = guard.lock().await;

        // The pull that held the guard before us may have satisfied this.
        if self.is_cached_local(reference) {
            return Ok(());
        }

        if self.check_runtime_local(reference).await? {
            return Ok(());
        }

        info!(image = reference, "pulling image");
        with_deadline("pull_image", self.deadline, self.runtime.pull_image(reference))
            .await
            .map_err(|err| AgentError::ImageUnavailable {
                reference: reference.to_string(),
                reason: err.to_string(),
            })?;

        // Pick up the digest the runtime now reports; fall back to a bare
        // local record if the listing is unavailable right after the pull.
        if !self.check_runtime_local(reference).await.unwrap_or(false) {
            warn!(image = reference, "pulled image not in local listing yet");
            let mut records = self.records.write().expect("lock poisoned");
            records.insert(
                reference.to_string(),
                ImageRecord {
                    reference: reference.to_string(),
                    digest: None,
                    local: true,
                },
            );
        }
        Ok(())
    }

    /// Re-lists local images from the runtime and rebuilds the cache.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::RuntimeOperationFailed`] if the listing fails.
    pub async fn refresh(&self) -> Result<(), AgentError> {
        let images = with_deadline(
            "list_local_images",
            self.deadline,
            self.runtime.list_local_images(),
        )
        .await?;
        let mut records = self.records.write().expect("lock poisoned");
        records.clear();
        for image in images {
            records.insert(
                image.reference.clone(),
                ImageRecord {
                    reference: image.reference,
                    digest: image.digest,
                    local: true,
                },
            );
        }
        debug!(count = records.len(), "image cache refreshed");
        Ok(())
    }

    /// References of images known to be locally available.
    #[must_use]
    pub fn local_references(&self) -> Vec<String> {
        let records = self.records.read().expect("lock poisoned");
        let mut refs: Vec<String> = records
            .values()
            .filter(|record| record.local)
            .map(|record| record.reference.clone())
            .collect();
        refs.sort();
        refs
    }

    fn is_cached_local(&self, reference: &str) -> bool {
        let records = self.records.read().expect("lock poisoned");
        records.get(reference).is_some_and(|record| record.local)
    }

    /// Asks the runtime whether the image is present, caching a hit.
    async fn check_runtime_local(&self, reference: &str) -> Result<bool, AgentError> {
        let images = with_deadline(
            "list_local_images",
            self.deadline,
            self.runtime.list_local_images(),
        )
        .await?;
        let found = images.iter().find(|image| image.reference == reference);
        if let Some(image) = found {
            let mut records = self.records.write().expect("lock poisoned");
            records.insert(
                reference.to_string(),
                ImageRecord {
                    reference: image.reference.clone(),
                    digest: image.digest.clone(),
                    local: true,
                },
            );
            return Ok(true);
        }
        Ok(false)
    }
}
