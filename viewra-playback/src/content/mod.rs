//! Content-addressed storage of completed transcode artifacts
//!
//! Layout: `{root}/content/{hash[0:2]}/{hash}/…` with a `metadata.json`
//! sibling per entry. Entries are immutable once published; only the
//! cleanup service deletes them.

pub mod fingerprint;

pub use fingerprint::{fingerprint, SourceIdentity};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{Error, Result};

pub const METADATA_FILE: &str = "metadata.json";

/// Persistent description of a content entry, stored as `metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub source_fingerprint: String,
    pub provider_id: String,
    pub produced_at: DateTime<Utc>,
    pub byte_size: u64,
    /// Paths relative to the entry directory
    pub artifacts: Vec<String>,
    pub primary_artifact: String,
}

/// A published, immutable artifact set addressed by content hash
#[derive(Debug, Clone)]
pub struct ContentEntry {
    pub hash: String,
    pub path: PathBuf,
    pub metadata: ContentMetadata,
}

/// Filesystem content store rooted at `{root}/content`
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sharded entry directory: `{root}/{hash[0:2]}/{hash}`
    fn entry_dir(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() < 2 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::validation("hash", "malformed content hash"));
        }
        Ok(self.root.join(&hash[0..2]).join(hash))
    }

    /// Look an entry up by hash. Absence is not an error.
    pub async fn lookup(&self, hash: &str) -> Result<Option<ContentEntry>> {
        let dir = self.entry_dir(hash)?;
        let metadata_path = dir.join(METADATA_FILE);
        let raw = match tokio::fs::read(&metadata_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata: ContentMetadata = serde_json::from_slice(&raw)?;
        Ok(Some(ContentEntry {
            hash: hash.to_string(),
            path: dir,
            metadata,
        }))
    }

    /// Publish a completed session workspace as the entry for `hash`.
    ///
    /// The move is a single rename, so readers never observe a partial
    /// entry. If the destination already exists another session won the
    /// race; the caller's workspace is discarded and the existing entry
    /// returned. Idempotent.
    pub async fn publish(
        &self,
        hash: &str,
        output_dir: &Path,
        mut metadata: ContentMetadata,
    ) -> Result<ContentEntry> {
        let dest = self.entry_dir(hash)?;
        if let Some(shard) = dest.parent() {
            tokio::fs::create_dir_all(shard).await?;
        }

        metadata.byte_size = dir_size(output_dir.to_path_buf()).await?;
        let raw = serde_json::to_vec_pretty(&metadata)?;
        tokio::fs::write(output_dir.join(METADATA_FILE), raw).await?;

        match tokio::fs::rename(output_dir, &dest).await {
            Ok(()) => {
                debug!(hash, path = %dest.display(), "published content entry");
                Ok(ContentEntry {
                    hash: hash.to_string(),
                    path: dest,
                    metadata,
                })
            }
            Err(_) if tokio::fs::try_exists(&dest).await.unwrap_or(false) => {
                // Lost the publish race: keep the existing entry, drop ours
                debug!(hash, "content entry already present, discarding duplicate workspace");
                let _ = tokio::fs::remove_dir_all(output_dir).await;
                self.lookup(hash).await?.ok_or_else(|| {
                    Error::Internal(format!("content entry {hash} vanished during publish"))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open an artifact for reading
    pub async fn open(&self, hash: &str, filename: &str) -> Result<tokio::fs::File> {
        let relative = sanitize_relative(filename)?;
        let path = self.entry_dir(hash)?.join(relative);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("{hash}/{filename}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an entry. Reserved for the cleanup service.
    pub async fn delete(&self, hash: &str) -> Result<()> {
        let dir = self.entry_dir(hash)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Total bytes under the content root
    pub async fn total_size(&self) -> Result<u64> {
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(0);
        }
        dir_size(self.root.clone()).await
    }

    /// Enumerate all entries. Entries with unreadable metadata are skipped
    /// with a warning rather than failing the sweep.
    pub async fn list(&self) -> Result<Vec<ContentEntry>> {
        let mut entries = Vec::new();
        let mut shards = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut hashes = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = hashes.next_entry().await? {
                let hash = entry.file_name().to_string_lossy().to_string();
                match self.lookup(&hash).await {
                    Ok(Some(found)) => entries.push(found),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(hash, error = %e, "skipping unreadable content entry");
                    }
                }
            }
        }
        Ok(entries)
    }
}

/// Reject absolute paths and parent traversal in served filenames
fn sanitize_relative(filename: &str) -> Result<PathBuf> {
    let path = Path::new(filename);
    let ok = !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
    if ok {
        Ok(path.to_path_buf())
    } else {
        Err(Error::validation("filename", "invalid artifact path"))
    }
}

/// Recursive directory size. Iterative to keep the future `Send` without
/// boxed recursion.
async fn dir_size(root: PathBuf) -> Result<u64> {
    let mut total = 0u64;
    let mut pending = vec![root];
    while let Some(dir) = pending.pop() {
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().await?.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(fp: &str) -> ContentMetadata {
        ContentMetadata {
            source_fingerprint: fp.to_string(),
            provider_id: "software".to_string(),
            produced_at: Utc::now(),
            byte_size: 0,
            artifacts: vec!["output.mp4".to_string()],
            primary_artifact: "output.mp4".to_string(),
        }
    }

    async fn stage_workspace(dir: &Path, payload: &[u8]) -> PathBuf {
        let workspace = dir.join("packaged");
        tokio::fs::create_dir_all(&workspace).await.expect("mkdir");
        tokio::fs::write(workspace.join("output.mp4"), payload)
            .await
            .expect("write artifact");
        workspace
    }

    const HASH: &str = "ab12cd34ab12cd34ab12cd34ab12cd34ab12cd34ab12cd34ab12cd34ab12cd34";

    #[tokio::test]
    async fn test_publish_then_lookup() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ContentStore::new(tmp.path().join("content"));
        store.ensure_root().await.expect("root");

        assert!(store.lookup(HASH).await.expect("lookup").is_none());

        let workspace = stage_workspace(tmp.path(), b"fake video payload").await;
        let entry = store
            .publish(HASH, &workspace, metadata(HASH))
            .await
            .expect("publish");
        assert_eq!(entry.hash, HASH);
        assert!(entry.metadata.byte_size > 0);

        let found = store.lookup(HASH).await.expect("lookup").expect("entry");
        assert_eq!(found.metadata.primary_artifact, "output.mp4");
        assert!(!tokio::fs::try_exists(&workspace).await.unwrap_or(true));
    }

    #[tokio::test]
    async fn test_publish_is_idempotent_dedup() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ContentStore::new(tmp.path().join("content"));
        store.ensure_root().await.expect("root");

        let first = stage_workspace(&tmp.path().join("a"), b"payload one").await;
        let winner = store
            .publish(HASH, &first, metadata(HASH))
            .await
            .expect("publish");

        let second = stage_workspace(&tmp.path().join("b"), b"payload two but same fingerprint").await;
        let dedup = store
            .publish(HASH, &second, metadata(HASH))
            .await
            .expect("dedup publish");

        // The loser's workspace is gone and the entry is the winner's
        assert!(!tokio::fs::try_exists(&second).await.unwrap_or(true));
        assert_eq!(dedup.metadata.byte_size, winner.metadata.byte_size);
        assert_eq!(store.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_open_rejects_traversal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ContentStore::new(tmp.path().join("content"));
        store.ensure_root().await.expect("root");

        assert!(store.open(HASH, "../escape").await.is_err());
        assert!(store.open(HASH, "/etc/passwd").await.is_err());
        assert!(matches!(
            store.open(HASH, "missing.mp4").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_then_lookup_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ContentStore::new(tmp.path().join("content"));
        store.ensure_root().await.expect("root");

        let workspace = stage_workspace(tmp.path(), b"payload").await;
        store
            .publish(HASH, &workspace, metadata(HASH))
            .await
            .expect("publish");

        store.delete(HASH).await.expect("delete");
        assert!(store.lookup(HASH).await.expect("lookup").is_none());
        // Deleting again is fine
        store.delete(HASH).await.expect("redelete");
    }

    #[tokio::test]
    async fn test_total_size_tracks_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ContentStore::new(tmp.path().join("content"));
        store.ensure_root().await.expect("root");
        assert_eq!(store.total_size().await.expect("size"), 0);

        let workspace = stage_workspace(tmp.path(), &[0u8; 4096]).await;
        store
            .publish(HASH, &workspace, metadata(HASH))
            .await
            .expect("publish");
        assert!(store.total_size().await.expect("size") >= 4096);
    }
}
