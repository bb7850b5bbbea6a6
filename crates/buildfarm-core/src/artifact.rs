//! Artifact storage abstraction.
//!
//! Build logs and produced files end up in the librarian. Restricted
//! artifacts (from private archives) are only served to authenticated
//! clients.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// File name as uploaded.
    pub name: String,
    /// Storage location (backend-specific).
    pub location: String,
    /// Hex SHA-256 of the content.
    pub checksum: String,
    /// Size in bytes.
    pub size: u64,
    pub content_type: String,
    pub restricted: bool,
    pub created_at: DateTime<Utc>,
}

/// An upload request.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub data: Bytes,
    pub content_type: String,
    pub restricted: bool,
}

impl Upload {
    pub fn new(name: impl Into<String>, data: Bytes) -> Self {
        let name = name.into();
        let content_type = guess_content_type(&name).to_string();
        Self {
            name,
            data,
            content_type,
            restricted: false,
        }
    }

    pub fn restricted(mut self, restricted: bool) -> Self {
        self.restricted = restricted;
        self
    }
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait Librarian: Send + Sync {
    /// Store an artifact and return a reference to it.
    async fn upload(&self, upload: Upload) -> Result<ArtifactRef>;

    /// Retrieve a previously stored artifact.
    async fn download(&self, reference: &ArtifactRef) -> Result<Bytes>;
}

/// Lowercase hex SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn guess_content_type(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or_default();
    match ext {
        "deb" | "udeb" | "ddeb" => "application/vnd.debian.binary-package",
        "gz" => "application/gzip",
        "xz" => "application/x-xz",
        "txt" | "log" => "text/plain",
        "changes" | "dsc" => "text/plain",
        _ => "application/octet-stream",
    }
}
