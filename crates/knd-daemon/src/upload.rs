//! Object storage uploader contract.
//!
//! Artifact upload is an external collaborator: the agent only decides
//! *what* to upload (new files in a batch execution's designated output
//! directory) and hands each path to this contract. Credentials, bucket
//! layout, and retries live behind the implementation.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Upload failure reported by an uploader implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum UploadError {
    /// The upload could not be completed.
    #[error("upload failed: {reason}")]
    Failed {
        /// Implementation-reported description.
        reason: String,
    },
}

/// Uploads a local file to external object storage.
#[async_trait]
pub trait ObjectStorageUploader: Send + Sync {
    /// Uploads the file and returns an external reference (URL or key) the
    /// manager can hand to clients.
    async fn upload(&self, local_path: &Path) -> Result<String, UploadError>;
}
