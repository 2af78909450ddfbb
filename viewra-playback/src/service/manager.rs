//! Core facade
//!
//! Coordinates the planner, provider manager, session store, content
//! store and supervisor behind the service contract the HTTP layer
//! consumes. One logical task per session; `start_transcode` returns as
//! soon as validation passes and the session row is persisted.

use chrono::Utc;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::content::{fingerprint, ContentMetadata, ContentStore, SourceIdentity};
use crate::models::{
    DeviceProfile, PlaybackDecision, ProviderStats, SessionRecord, SessionResult,
    TranscodeProgress, TranscodeRequest, TranscodeStage,
};
use crate::planner::PlaybackPlanner;
use crate::provider::{
    JobContext, ProgressSink, ProviderInfo, ProviderManager, TranscodeProvider,
};
use crate::repository::SessionStore;
use crate::supervisor::ProcessSupervisor;
use crate::{Error, Result};

/// Result of `start_transcode`: where the caller can reach the output
#[derive(Debug, Clone)]
pub struct StartedTranscode {
    pub session_id: Uuid,
    pub provider_id: String,
    pub content_hash: String,
    /// `/content/{hash}/{primary}`; valid once the session completes, and
    /// immediately on a dedup fast path
    pub stream_url: String,
}

struct SessionHandle {
    cancel: CancellationToken,
    /// Set right after spawn; the task may already have finished and
    /// removed the whole entry by then
    task: Option<JoinHandle<()>>,
}

/// Process-wide manager instance with an explicit start/stop lifecycle
pub struct TranscodeManager {
    max_concurrent: usize,
    queue_size: usize,
    session_timeout: std::time::Duration,
    sessions_root: PathBuf,
    store: SessionStore,
    content: ContentStore,
    providers: Arc<ProviderManager>,
    planner: PlaybackPlanner,
    supervisor: Arc<ProcessSupervisor>,
    active: Arc<DashMap<Uuid, SessionHandle>>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl TranscodeManager {
    #[must_use]
    pub fn new(
        config: &Config,
        store: SessionStore,
        content: ContentStore,
        providers: Arc<ProviderManager>,
        planner: PlaybackPlanner,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        Self {
            max_concurrent: config.transcoding.max_concurrent,
            queue_size: config.transcoding.queue_size,
            session_timeout: config.transcoding.session_timeout(),
            sessions_root: config.transcoding.sessions_root(),
            store,
            content,
            providers,
            planner,
            supervisor,
            active: Arc::new(DashMap::new()),
            slots: Arc::new(Semaphore::new(config.transcoding.max_concurrent)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Startup: create the on-disk trees, kill orphaned processes from a
    /// previous run, and fail sessions whose processes did not survive.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.sessions_root).await?;
        self.content.ensure_root().await?;
        let killed = self.supervisor.kill_orphans().await;
        if killed > 0 {
            warn!(killed, "killed orphaned encoder processes at startup");
        }
        self.store.recover_orphaned().await?;
        info!("transcoding core initialized");
        Ok(())
    }

    /// Plan playback for a source and client profile
    pub async fn decide_playback(
        &self,
        media_path: &Path,
        profile: &DeviceProfile,
    ) -> Result<PlaybackDecision> {
        self.planner.decide(media_path, profile).await
    }

    /// Admit, persist and dispatch a transcode. Suspends only for
    /// validation and the session row; encoding happens on its own task.
    pub async fn start_transcode(&self, request: TranscodeRequest) -> Result<StartedTranscode> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Internal("core is shutting down".to_string()));
        }
        request.validate()?;

        let source = SourceIdentity::of(&request.input_path).await?;
        let hash = fingerprint(&request, source);
        let stream_url = format!(
            "/content/{hash}/{}",
            request.container.primary_artifact()
        );

        // Dedup fast path: the artifact set already exists
        if let Some(entry) = self.content.lookup(&hash).await? {
            let session = self.store.create(&entry.metadata.provider_id, &request).await?;
            let result = SessionResult {
                content_hash: hash.clone(),
                primary_artifact: entry.metadata.primary_artifact.clone(),
                artifacts: entry.metadata.artifacts.clone(),
                total_bytes: entry.metadata.byte_size,
            };
            self.store.complete(session.id, &result).await?;
            info!(session = %session.id, hash = %hash, "served transcode from content store");
            return Ok(StartedTranscode {
                session_id: session.id,
                provider_id: entry.metadata.provider_id,
                content_hash: hash,
                stream_url,
            });
        }

        // Admission: running plus queued may not exceed the configured cap
        let active = self.store.count_active().await?;
        if active >= (self.max_concurrent + self.queue_size) as u64 {
            return Err(Error::AdmissionFull);
        }

        let provider = self.providers.select(&request).await?;
        let provider_id = provider.info().id;
        let session = self.store.create(&provider_id, &request).await?;
        let workspace = self.sessions_root.join(&session.directory_path);
        tokio::fs::create_dir_all(&workspace).await?;

        let cancel = self.shutdown.child_token();
        let job = SessionJob {
            session_id: session.id,
            request,
            hash: hash.clone(),
            workspace,
            provider,
            store: self.store.clone(),
            content: self.content.clone(),
            supervisor: self.supervisor.clone(),
            timeout: self.session_timeout,
            cancel: cancel.clone(),
            slots: self.slots.clone(),
            active: self.active.clone(),
        };
        // Registered before the spawn so a stop can always find the
        // token; the task handle is attached right after
        self.active.insert(
            session.id,
            SessionHandle {
                cancel: cancel.clone(),
                task: None,
            },
        );
        let task = tokio::spawn(run_session(job));
        if let Some(mut handle) = self.active.get_mut(&session.id) {
            handle.task = Some(task);
        }

        info!(session = %session.id, provider = %provider_id, hash = %hash, "transcode session dispatched");
        Ok(StartedTranscode {
            session_id: session.id,
            provider_id,
            content_hash: hash,
            stream_url,
        })
    }

    /// Current progress; `NotFound` for unknown sessions
    pub async fn get_progress(&self, id: Uuid) -> Result<TranscodeProgress> {
        Ok(self.store.get(id).await?.progress)
    }

    /// Session snapshot
    pub async fn get_session(&self, id: Uuid) -> Result<SessionRecord> {
        self.store.get(id).await
    }

    /// Stop a session. Idempotent: stopping a finished or unknown session
    /// is a no-op success.
    pub async fn stop_transcode(&self, id: Uuid) -> Result<()> {
        if let Some(handle) = self.active.get(&id) {
            handle.cancel.cancel();
        }
        match self.store.cancel(id).await {
            Ok(true) => {
                info!(session = %id, "session cancelled");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Replace a session with one starting at `seek_seconds`. The old
    /// session is cancelled and its workspace eagerly deleted.
    pub async fn seek_ahead(&self, id: Uuid, seek_seconds: f64) -> Result<StartedTranscode> {
        let old = self.store.get(id).await?;

        if let Some((_, handle)) = self.active.remove(&id) {
            handle.cancel.cancel();
            if let Some(task) = handle.task {
                let _ = task.await;
            }
        }
        let _ = self.store.cancel(id).await;

        let old_workspace = self.sessions_root.join(&old.directory_path);
        if let Err(e) = tokio::fs::remove_dir_all(&old_workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session = %id, error = %e, "failed to remove replaced workspace");
            }
        }

        let mut request = old.request;
        if let Some(total) = request.duration_seconds {
            let consumed = seek_seconds - request.seek_seconds;
            request.duration_seconds = Some(total - consumed).filter(|d| *d > 0.0);
        }
        request.seek_seconds = seek_seconds;
        self.start_transcode(request).await
    }

    /// Registered providers, priority descending
    #[must_use]
    pub fn list_providers(&self) -> Vec<ProviderInfo> {
        self.providers.list()
    }

    /// Aggregated counters for one provider
    pub async fn provider_stats(&self, provider_id: &str) -> Result<ProviderStats> {
        self.store.provider_stats(provider_id).await
    }

    #[must_use]
    pub fn content_store(&self) -> &ContentStore {
        &self.content
    }

    #[must_use]
    pub fn session_store(&self) -> &SessionStore {
        &self.store
    }

    /// Graceful shutdown: cancel the queue and running sessions, wait for
    /// every supervised process to be reaped, then return.
    pub async fn shutdown(&self) {
        info!("transcoding core shutting down");

        // Record the reason before waking the tasks, so their own cancel
        // write (reasonless) loses the guarded-transition race
        let ids: Vec<Uuid> = self.active.iter().map(|entry| *entry.key()).collect();
        for id in &ids {
            let _ = self.store.cancel_with_reason(*id, "shutdown").await;
        }
        self.shutdown.cancel();

        for id in ids {
            if let Some((_, handle)) = self.active.remove(&id) {
                if let Some(task) = handle.task {
                    let _ = task.await;
                }
            }
        }
        info!("transcoding core stopped");
    }
}

struct SessionJob {
    session_id: Uuid,
    request: TranscodeRequest,
    hash: String,
    workspace: PathBuf,
    provider: Arc<dyn TranscodeProvider>,
    store: SessionStore,
    content: ContentStore,
    supervisor: Arc<ProcessSupervisor>,
    timeout: std::time::Duration,
    cancel: CancellationToken,
    slots: Arc<Semaphore>,
    active: Arc<DashMap<Uuid, SessionHandle>>,
}

/// One logical worker per session: wait for a running slot, execute the
/// provider's job, publish, and record the terminal state.
async fn run_session(job: SessionJob) {
    let sid = job.session_id;

    // Queued until a running slot frees up
    let permit = tokio::select! {
        () = job.cancel.cancelled() => {
            debug!(session = %sid, "cancelled while queued");
            job.active.remove(&sid);
            return;
        }
        permit = job.slots.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                job.active.remove(&sid);
                return;
            }
        },
    };

    let (sink, mut progress_rx) = ProgressSink::channel();
    let pump_store = job.store.clone();
    let pump = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            if let Err(e) = pump_store.update_progress(sid, &progress).await {
                debug!(session = %sid, error = %e, "progress write dropped");
            }
        }
    });

    let ctx = JobContext {
        session_id: sid,
        request: job.request.clone(),
        workspace: job.workspace.clone(),
        progress: sink,
        cancel: job.cancel.clone(),
        supervisor: job.supervisor.clone(),
    };

    let outcome = {
        let run = job.provider.run(&ctx);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            () = tokio::time::sleep(job.timeout) => {
                warn!(session = %sid, "session exceeded hard timeout");
                let _ = job.store.cancel_with_reason(sid, "timeout").await;
                job.cancel.cancel();
                // The provider observes the cancellation, stops its
                // processes and returns promptly
                run.await
            }
        }
    };

    drop(ctx);
    let _ = pump.await;

    match outcome {
        Ok(output) => {
            let _ = job
                .store
                .update_progress(sid, &TranscodeProgress::at(99.0, TranscodeStage::Publishing))
                .await;

            let metadata = ContentMetadata {
                source_fingerprint: job.hash.clone(),
                provider_id: job.provider.info().id,
                produced_at: Utc::now(),
                byte_size: output.total_bytes,
                artifacts: output.artifacts.clone(),
                primary_artifact: output.primary_artifact.clone(),
            };
            match job.content.publish(&job.hash, &output.output_dir, metadata).await {
                Ok(entry) => {
                    let result = SessionResult {
                        content_hash: job.hash.clone(),
                        primary_artifact: entry.metadata.primary_artifact,
                        artifacts: entry.metadata.artifacts,
                        total_bytes: entry.metadata.byte_size,
                    };
                    match job.store.complete(sid, &result).await {
                        Ok(true) => info!(session = %sid, hash = %job.hash, "session completed"),
                        Ok(false) => debug!(session = %sid, "completion skipped, session already terminal"),
                        Err(e) => error!(session = %sid, error = %e, "failed to record completion"),
                    }
                    // Encoded intermediates are no longer needed
                    let _ = tokio::fs::remove_dir_all(&job.workspace).await;
                }
                Err(e) => {
                    error!(session = %sid, error = %e, "publish failed");
                    let _ = job.store.fail(sid, &format!("publish failed: {e}")).await;
                }
            }
        }
        Err(e) if job.cancel.is_cancelled() => {
            // Stop, seek-ahead, timeout or shutdown already set the
            // terminal state; the guard makes a second write a no-op
            debug!(session = %sid, error = %e, "session ended by cancellation");
            let _ = job.store.cancel(sid).await;
        }
        Err(e) => {
            error!(session = %sid, error = %e, "session failed");
            let _ = job.store.fail(sid, &e.to_string()).await;
        }
    }

    job.active.remove(&sid);
    drop(permit);
}
