//! Librarian backends.

use async_trait::async_trait;
use buildfarm_core::artifact::{ArtifactRef, Librarian, Upload, content_hash};
use buildfarm_core::{Error, Result};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Librarian reached over HTTP.
///
/// Uploads are POSTed as raw bytes to `<url>/upload?name=..&restricted=..`
/// and the service answers with the download location.
pub struct HttpLibrarian {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    location: String,
}

impl HttpLibrarian {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Librarian for HttpLibrarian {
    async fn upload(&self, upload: Upload) -> Result<ArtifactRef> {
        let checksum = content_hash(&upload.data);
        let size = upload.data.len() as u64;
        let url = format!(
            "{}/upload?name={}&restricted={}",
            self.base_url,
            urlencoding::encode(&upload.name),
            upload.restricted
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", &upload.content_type)
            .header("X-Content-Sha256", &checksum)
            .body(upload.data)
            .send()
            .await
            .map_err(|e| Error::Upload(e.to_string()))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Upload(format!("librarian rejected {}: {}", upload.name, text)));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| Error::Upload(format!("bad librarian response: {}", e)))?;

        Ok(ArtifactRef {
            name: upload.name,
            location: body.location,
            checksum,
            size,
            content_type: upload.content_type,
            restricted: upload.restricted,
            created_at: Utc::now(),
        })
    }

    async fn download(&self, reference: &ArtifactRef) -> Result<Bytes> {
        let response = self
            .client
            .get(&reference.location)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::NotFound(reference.location.clone()));
        }
        response
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// Librarian storing files under a local directory, keyed by content hash.
pub struct FsLibrarian {
    root: PathBuf,
}

impl FsLibrarian {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, checksum: &str, name: &str) -> PathBuf {
        let area = if checksum.len() >= 2 { &checksum[..2] } else { "00" };
        self.root.join(area).join(checksum).join(sanitize(name))
    }
}

fn sanitize(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    base.to_string()
}

#[async_trait]
impl Librarian for FsLibrarian {
    async fn upload(&self, upload: Upload) -> Result<ArtifactRef> {
        let checksum = content_hash(&upload.data);
        let path = self.path_for(&checksum, &upload.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Upload(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&path, &upload.data)
            .await
            .map_err(|e| Error::Upload(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Stored artifact");

        Ok(ArtifactRef {
            name: upload.name,
            location: path.display().to_string(),
            checksum,
            size: upload.data.len() as u64,
            content_type: upload.content_type,
            restricted: upload.restricted,
            created_at: Utc::now(),
        })
    }

    async fn download(&self, reference: &ArtifactRef) -> Result<Bytes> {
        let path = self.path_for(&reference.checksum, &reference.name);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::NotFound(path.display().to_string()))?;
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_librarian_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let librarian = FsLibrarian::new(dir.path());

        let upload = Upload::new("hello_2.10-1_i386.deb", Bytes::from_static(b"deb bytes"));
        let stored = librarian.upload(upload).await.unwrap();
        assert_eq!(stored.checksum, content_hash(b"deb bytes"));
        assert_eq!(stored.size, 9);
        assert!(stored.location.starts_with(&dir.path().display().to_string()));

        let data = librarian.download(&stored).await.unwrap();
        assert_eq!(&data[..], b"deb bytes");
    }

    #[tokio::test]
    async fn test_fs_librarian_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let librarian = FsLibrarian::new(dir.path());

        let stored = librarian
            .upload(Upload::new("../../etc/passwd", Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert!(stored.location.ends_with("/passwd"));
        assert!(Path::new(&stored.location).starts_with(dir.path()));
    }
}
