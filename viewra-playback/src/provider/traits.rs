// Transcoding Provider Traits
//
// Uniform contract every encoder backend implements

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{ContainerFormat, TranscodeProgress, TranscodeRequest};
use crate::supervisor::ProcessSupervisor;
use crate::Result;

/// A hardware accelerator a provider can drive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareAccel {
    /// Accelerator family: "vaapi", "nvenc", "videotoolbox"
    pub kind: String,
    /// Device node when relevant (e.g. "/dev/dri/renderD128")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub available: bool,
}

/// Static capabilities of a provider, used for selection and listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Unique, non-empty, stable across restarts
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub supported_formats: Vec<ContainerFormat>,
    #[serde(default)]
    pub accelerators: Vec<HardwareAccel>,
}

impl ProviderInfo {
    /// Whether an available accelerator of `kind` is exposed
    #[must_use]
    pub fn has_accelerator(&self, kind: &str) -> bool {
        self.accelerators
            .iter()
            .any(|a| a.available && a.kind.eq_ignore_ascii_case(kind))
    }

    #[must_use]
    pub fn supports(&self, container: ContainerFormat) -> bool {
        self.supported_formats.contains(&container)
    }
}

/// Progress reports flow from the provider's job back to the session task
/// by message; providers never touch the session store.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<TranscodeProgress>,
}

impl ProgressSink {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TranscodeProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report progress; silently dropped once the session task is gone
    pub fn report(&self, progress: TranscodeProgress) {
        let _ = self.tx.send(progress);
    }
}

/// Everything a provider needs to execute one session's job
pub struct JobContext {
    pub session_id: Uuid,
    pub request: TranscodeRequest,
    /// Per-session scratch directory; the provider writes `encoded/` and
    /// `packaged/` beneath it
    pub workspace: PathBuf,
    pub progress: ProgressSink,
    pub cancel: CancellationToken,
    pub supervisor: Arc<ProcessSupervisor>,
}

/// Artifacts a finished job hands back for publishing
#[derive(Debug, Clone)]
pub struct JobOutput {
    /// Directory whose whole contents become the content entry
    pub output_dir: PathBuf,
    /// Paths relative to `output_dir`
    pub artifacts: Vec<String>,
    /// The artifact a player requests first
    pub primary_artifact: String,
    pub total_bytes: u64,
}

/// Uniform provider contract. Implementations supply their own process
/// invocations; the core never branches on provider identity.
#[async_trait]
pub trait TranscodeProvider: Send + Sync {
    /// Static capabilities; `info().id` is the registry key
    fn info(&self) -> ProviderInfo;

    /// Accelerators with current availability
    fn hardware_info(&self) -> Vec<HardwareAccel> {
        self.info().accelerators
    }

    /// Execute the job to completion, reporting progress through
    /// `ctx.progress` and honoring `ctx.cancel`. Cancellation should stop
    /// child processes and return promptly; partial output stays in the
    /// workspace for cleanup.
    async fn run(&self, ctx: &JobContext) -> Result<JobOutput>;
}

/// Collect the relative paths of every file under `dir`, sorted for
/// deterministic artifact lists
pub async fn collect_artifacts(dir: &Path) -> Result<(Vec<String>, u64)> {
    let mut artifacts = Vec::new();
    let mut total = 0u64;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut rd = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = rd.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().await?.len();
                if let Ok(relative) = entry.path().strip_prefix(dir) {
                    artifacts.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
    }
    artifacts.sort();
    Ok((artifacts, total))
}
