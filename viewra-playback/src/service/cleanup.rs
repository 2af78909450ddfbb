//! Background cleanup
//!
//! Periodic loop enforcing the content quota, session retention, and
//! orphan removal. A failing sweep is logged and never stops future
//! cycles; the loop exits on cancellation after the current cycle.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CleanupConfig;
use crate::content::ContentStore;
use crate::repository::SessionStore;
use crate::supervisor::ProcessSupervisor;
use crate::Result;

/// Emergency cleanup stops once usage is back under this share of the
/// quota
const QUOTA_TARGET_RATIO: f64 = 0.9;
/// Entries and workspaces younger than this are never reclaimed
const MIN_RECLAIM_AGE_SECS: u64 = 3600;

/// Counters from one cleanup cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupStats {
    pub expired_sessions: u64,
    pub workspaces_removed: u64,
    pub orphan_workspaces: u64,
    pub content_entries_removed: u64,
    pub bytes_reclaimed: u64,
    pub orphan_processes: u64,
}

pub struct CleanupService {
    config: CleanupConfig,
    store: SessionStore,
    content: ContentStore,
    supervisor: Arc<ProcessSupervisor>,
    sessions_root: PathBuf,
    quota_bytes: u64,
    cancel: CancellationToken,
}

impl CleanupService {
    #[must_use]
    pub fn new(
        config: CleanupConfig,
        store: SessionStore,
        content: ContentStore,
        supervisor: Arc<ProcessSupervisor>,
        sessions_root: PathBuf,
    ) -> Self {
        let quota_bytes = config.max_total_size_bytes();
        Self {
            config,
            store,
            content,
            supervisor,
            sessions_root,
            quota_bytes,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the periodic loop
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        info!("cleanup loop stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let stats = self.run_cycle().await;
                        info!(
                            expired = stats.expired_sessions,
                            orphan_dirs = stats.orphan_workspaces,
                            entries_removed = stats.content_entries_removed,
                            bytes_reclaimed = stats.bytes_reclaimed,
                            orphan_processes = stats.orphan_processes,
                            "cleanup cycle finished"
                        );
                    }
                }
            }
        })
    }

    /// Request the loop to exit after the current cycle
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One full cycle. Each sweep's failure is contained.
    pub async fn run_cycle(&self) -> CleanupStats {
        let mut stats = CleanupStats::default();
        if let Err(e) = self.quota_sweep(&mut stats).await {
            warn!(error = %e, "quota sweep failed");
        }
        if let Err(e) = self.retention_sweep(&mut stats).await {
            warn!(error = %e, "retention sweep failed");
        }
        if let Err(e) = self.orphan_workspace_sweep(&mut stats).await {
            warn!(error = %e, "orphan workspace sweep failed");
        }
        if let Err(e) = self.orphan_process_sweep(&mut stats).await {
            warn!(error = %e, "orphan process sweep failed");
        }
        stats
    }

    /// Emergency cleanup when the content tree exceeds its quota:
    /// oldest-last-accessed entries go first, entries younger than an hour
    /// are spared, and deletion stops at 90% of the limit.
    async fn quota_sweep(&self, stats: &mut CleanupStats) -> Result<()> {
        let mut usage = self.content.total_size().await?;
        if usage <= self.quota_bytes {
            return Ok(());
        }
        warn!(usage, limit = self.quota_bytes, "content quota exceeded, running emergency cleanup");
        let target = (self.quota_bytes as f64 * QUOTA_TARGET_RATIO) as u64;

        let mut entries = Vec::new();
        for entry in self.content.list().await? {
            let last_accessed = self
                .store
                .last_access_for_hash(&entry.hash)
                .await?
                .unwrap_or(entry.metadata.produced_at);
            entries.push((last_accessed, entry));
        }
        entries.sort_by_key(|(last_accessed, _)| *last_accessed);

        let min_age_cutoff = Utc::now() - chrono::Duration::seconds(MIN_RECLAIM_AGE_SECS as i64);
        for (_, entry) in entries {
            if usage <= target {
                break;
            }
            if entry.metadata.produced_at > min_age_cutoff {
                continue;
            }
            let size = entry.metadata.byte_size;
            match self.content.delete(&entry.hash).await {
                Ok(()) => {
                    debug!(hash = %entry.hash, size, "evicted content entry");
                    usage = usage.saturating_sub(size);
                    stats.content_entries_removed += 1;
                    stats.bytes_reclaimed += size;
                }
                Err(e) => warn!(hash = %entry.hash, error = %e, "failed to evict content entry"),
            }
        }
        Ok(())
    }

    /// Delete terminal sessions past retention, cascading to workspaces
    async fn retention_sweep(&self, stats: &mut CleanupStats) -> Result<()> {
        let removed = self
            .store
            .sweep_expired(
                self.config.retention_completed(),
                self.config.retention_failed(),
            )
            .await?;
        stats.expired_sessions += removed.len() as u64;

        for session in removed {
            let workspace = self.sessions_root.join(&session.directory_path);
            match tokio::fs::remove_dir_all(&workspace).await {
                Ok(()) => stats.workspaces_removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(session = %session.id, error = %e, "failed to remove workspace");
                }
            }
        }
        Ok(())
    }

    /// Remove workspace directories with no matching session record, once
    /// they are old enough not to be a session mid-creation
    async fn orphan_workspace_sweep(&self, stats: &mut CleanupStats) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.sessions_root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let min_age = std::time::Duration::from_secs(MIN_RECLAIM_AGE_SECS);

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let age = entry
                .metadata()
                .await?
                .modified()
                .ok()
                .and_then(|t| t.elapsed().ok());
            let old_enough = age.is_some_and(|a| a >= min_age);
            if !old_enough {
                continue;
            }
            if self.store.directory_known(&name).await? {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    debug!(directory = %name, "removed orphaned workspace");
                    stats.orphan_workspaces += 1;
                }
                Err(e) => warn!(directory = %name, error = %e, "failed to remove orphan"),
            }
        }
        Ok(())
    }

    /// Kill tagged processes whose sessions are no longer live
    async fn orphan_process_sweep(&self, stats: &mut CleanupStats) -> Result<()> {
        for (pid, tag) in self.supervisor.scan_tagged() {
            let live = match Uuid::parse_str(&tag) {
                Ok(id) => self.store.session_active(id).await?,
                Err(_) => false,
            };
            if live {
                continue;
            }
            warn!(pid, session = %tag, "killing orphaned encoder process");
            if self.supervisor.kill_pid(pid).await {
                stats.orphan_processes += 1;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn set_quota_bytes(&mut self, bytes: u64) {
        self.quota_bytes = bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentMetadata;
    use crate::models::{ContainerFormat, SpeedPriority, TranscodeRequest};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn fixtures(root: &std::path::Path) -> (SessionStore, ContentStore, CleanupService) {
        // A single connection: every pooled connection would otherwise get
        // its own private in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory database");
        let store = SessionStore::new(pool);
        store.migrate().await.expect("migrate");

        let content = ContentStore::new(root.join("content"));
        content.ensure_root().await.expect("root");

        let service = CleanupService::new(
            CleanupConfig {
                retention_completed_seconds: 0,
                retention_failed_seconds: 0,
                ..CleanupConfig::default()
            },
            store.clone(),
            content.clone(),
            Arc::new(ProcessSupervisor::new(Duration::from_millis(200))),
            root.join("sessions"),
        );
        (store, content, service)
    }

    fn request() -> TranscodeRequest {
        TranscodeRequest {
            input_path: "/media/movie.mkv".into(),
            media_id: "m".to_string(),
            container: ContainerFormat::Mp4,
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            resolution: None,
            quality: 60,
            speed_priority: SpeedPriority::Balanced,
            seek_seconds: 0.0,
            duration_seconds: None,
            enable_abr: false,
            prefer_hardware: false,
            hardware_type: None,
            max_video_bitrate_kbps: None,
            max_audio_bitrate_kbps: None,
        }
    }

    const HASH: &str = "ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00";

    async fn publish_entry(
        content: &ContentStore,
        staging: &std::path::Path,
        produced_at: chrono::DateTime<Utc>,
    ) {
        let workspace = staging.join("packaged");
        tokio::fs::create_dir_all(&workspace).await.expect("mkdir");
        tokio::fs::write(workspace.join("output.mp4"), vec![0u8; 2048])
            .await
            .expect("write");
        content
            .publish(
                HASH,
                &workspace,
                ContentMetadata {
                    source_fingerprint: HASH.to_string(),
                    provider_id: "software".to_string(),
                    produced_at,
                    byte_size: 0,
                    artifacts: vec!["output.mp4".to_string()],
                    primary_artifact: "output.mp4".to_string(),
                },
            )
            .await
            .expect("publish");
    }

    #[tokio::test]
    async fn test_retention_cascades_to_workspace() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, _content, service) = fixtures(tmp.path()).await;

        let session = store.create("software", &request()).await.expect("create");
        let workspace = tmp.path().join("sessions").join(&session.directory_path);
        tokio::fs::create_dir_all(&workspace).await.expect("mkdir");
        store.cancel(session.id).await.expect("cancel");

        let stats = service.run_cycle().await;
        assert_eq!(stats.expired_sessions, 1);
        assert_eq!(stats.workspaces_removed, 1);
        assert!(!tokio::fs::try_exists(&workspace).await.unwrap_or(true));
        assert!(store.get(session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_live_sessions_survive_cycle() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, _content, service) = fixtures(tmp.path()).await;

        let session = store.create("software", &request()).await.expect("create");
        let workspace = tmp.path().join("sessions").join(&session.directory_path);
        tokio::fs::create_dir_all(&workspace).await.expect("mkdir");

        let stats = service.run_cycle().await;
        assert_eq!(stats.expired_sessions, 0);
        assert!(tokio::fs::try_exists(&workspace).await.unwrap_or(false));
        assert!(store.get(session.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_recent_orphan_workspace_is_kept() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_store, _content, service) = fixtures(tmp.path()).await;

        // No session row, but too young to reclaim
        let orphan = tmp.path().join("sessions").join("mp4_software_dead");
        tokio::fs::create_dir_all(&orphan).await.expect("mkdir");

        let stats = service.run_cycle().await;
        assert_eq!(stats.orphan_workspaces, 0);
        assert!(tokio::fs::try_exists(&orphan).await.unwrap_or(false));
    }

    #[tokio::test]
    async fn test_quota_evicts_old_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_store, content, mut service) = fixtures(tmp.path()).await;

        publish_entry(&content, tmp.path(), Utc::now() - chrono::Duration::hours(3)).await;
        service.set_quota_bytes(1024);

        let stats = service.run_cycle().await;
        assert_eq!(stats.content_entries_removed, 1);
        assert!(stats.bytes_reclaimed >= 2048);
        assert!(content.lookup(HASH).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn test_quota_spares_young_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_store, content, mut service) = fixtures(tmp.path()).await;

        publish_entry(&content, tmp.path(), Utc::now()).await;
        service.set_quota_bytes(1024);

        let stats = service.run_cycle().await;
        assert_eq!(stats.content_entries_removed, 0);
        assert!(content.lookup(HASH).await.expect("lookup").is_some());
    }

    #[tokio::test]
    async fn test_quota_noop_under_limit() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_store, content, service) = fixtures(tmp.path()).await;

        publish_entry(&content, tmp.path(), Utc::now() - chrono::Duration::hours(3)).await;

        let stats = service.run_cycle().await;
        assert_eq!(stats.content_entries_removed, 0);
        assert!(content.lookup(HASH).await.expect("lookup").is_some());
    }
}
