// Provider Manager
//
// Registry of encoder backends with deterministic per-request selection

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::traits::{ProviderInfo, TranscodeProvider};
use crate::models::TranscodeRequest;
use crate::repository::SessionStore;
use crate::{Error, Result};

/// Score bonus for an available accelerator matching the request
const HARDWARE_BONUS: i64 = 500;
/// Score penalty per active session on a provider
const LOAD_PENALTY: i64 = 10;

/// Registry of transcoding providers. Read-heavy: `select` takes a
/// snapshot under a short read lock, so observed load may trail reality
/// by one tick.
pub struct ProviderManager {
    providers: RwLock<HashMap<String, Arc<dyn TranscodeProvider>>>,
    store: SessionStore,
}

impl ProviderManager {
    #[must_use]
    pub fn new(store: SessionStore) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Register a provider. Rejects empty and duplicate ids.
    pub fn register(&self, provider: Arc<dyn TranscodeProvider>) -> Result<()> {
        let info = provider.info();
        if info.id.is_empty() {
            return Err(Error::validation("provider_id", "must not be empty"));
        }
        let mut providers = self.providers.write();
        if providers.contains_key(&info.id) {
            return Err(Error::AlreadyExists(format!("provider {}", info.id)));
        }
        info!(provider = %info.id, priority = info.priority, "registered provider");
        providers.insert(info.id, provider);
        Ok(())
    }

    /// Remove a provider. Fails with `ProviderBusy` while it still owns
    /// non-terminal sessions.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        let stats = self.store.provider_stats(id).await?;
        if stats.active > 0 {
            return Err(Error::ProviderBusy(format!(
                "{id} owns {} active sessions",
                stats.active
            )));
        }
        let removed = self.providers.write().remove(id);
        if removed.is_none() {
            return Err(Error::NotFound(format!("provider {id}")));
        }
        info!(provider = id, "unregistered provider");
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn TranscodeProvider>> {
        self.providers.read().get(id).cloned()
    }

    /// Pick the best provider for a request.
    ///
    /// Among providers supporting the requested container:
    /// `priority * 100`, plus the hardware bonus when the request prefers
    /// hardware and a matching accelerator reports available, minus a
    /// load penalty per active session. Ties break on provider id for
    /// determinism.
    pub async fn select(&self, request: &TranscodeRequest) -> Result<Arc<dyn TranscodeProvider>> {
        let snapshot: Vec<Arc<dyn TranscodeProvider>> =
            self.providers.read().values().cloned().collect();
        let loads = self.store.active_by_provider().await?;

        let mut best: Option<(i64, ProviderInfo, Arc<dyn TranscodeProvider>)> = None;
        for provider in snapshot {
            let info = provider.info();
            if !info.supports(request.container) {
                continue;
            }
            let score = score(&info, request, &loads);
            debug!(provider = %info.id, score, "selection candidate");
            let better = match &best {
                None => true,
                Some((best_score, best_info, _)) => {
                    score > *best_score || (score == *best_score && info.id < best_info.id)
                }
            };
            if better {
                best = Some((score, info, provider));
            }
        }

        best.map(|(_, _, provider)| provider).ok_or_else(|| {
            Error::NoCapableProvider(request.container.as_str().to_string())
        })
    }

    /// All registered providers, priority descending, ties by id
    #[must_use]
    pub fn list(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<ProviderInfo> = self
            .providers
            .read()
            .values()
            .map(|p| p.info())
            .collect();
        infos.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

fn score(info: &ProviderInfo, request: &TranscodeRequest, loads: &HashMap<String, u64>) -> i64 {
    let mut score = i64::from(info.priority) * 100;
    if request.prefer_hardware {
        let matches = match request.hardware_type.as_deref() {
            Some(kind) => info.has_accelerator(kind),
            None => info.accelerators.iter().any(|a| a.available),
        };
        if matches {
            score += HARDWARE_BONUS;
        }
    }
    let load = loads.get(&info.id).copied().unwrap_or(0);
    score - LOAD_PENALTY * load as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerFormat, SpeedPriority};
    use crate::provider::SyntheticProvider;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn manager() -> ProviderManager {
        // A single connection: every pooled connection would otherwise get
        // its own private in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory database");
        let store = SessionStore::new(pool);
        store.migrate().await.expect("migrate");
        ProviderManager::new(store)
    }

    fn request(container: ContainerFormat) -> TranscodeRequest {
        TranscodeRequest {
            input_path: "/media/movie.mkv".into(),
            media_id: "m".to_string(),
            container,
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

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let manager = manager().await;
        manager
            .register(Arc::new(SyntheticProvider::new("a")))
            .expect("register");
        assert!(matches!(
            manager.register(Arc::new(SyntheticProvider::new("a"))),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            manager.register(Arc::new(SyntheticProvider::new(""))),
            Err(Error::Validation { .. })
        ));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_select_highest_priority_wins() {
        let manager = manager().await;
        manager
            .register(Arc::new(SyntheticProvider::new("low").with_priority(5)))
            .expect("register");
        manager
            .register(Arc::new(SyntheticProvider::new("high").with_priority(90)))
            .expect("register");

        let selected = manager
            .select(&request(ContainerFormat::Mp4))
            .await
            .expect("select");
        assert_eq!(selected.info().id, "high");
    }

    #[tokio::test]
    async fn test_select_tie_breaks_on_id() {
        let manager = manager().await;
        manager
            .register(Arc::new(SyntheticProvider::new("bravo").with_priority(50)))
            .expect("register");
        manager
            .register(Arc::new(SyntheticProvider::new("alpha").with_priority(50)))
            .expect("register");

        let selected = manager
            .select(&request(ContainerFormat::Mp4))
            .await
            .expect("select");
        assert_eq!(selected.info().id, "alpha");
    }

    #[tokio::test]
    async fn test_select_no_capable_provider() {
        let manager = manager().await;
        assert!(matches!(
            manager.select(&request(ContainerFormat::Hls)).await,
            Err(Error::NoCapableProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_load_penalty_shifts_selection() {
        let manager = manager().await;
        manager
            .register(Arc::new(SyntheticProvider::new("busy").with_priority(50)))
            .expect("register");
        manager
            .register(Arc::new(SyntheticProvider::new("idle").with_priority(49)))
            .expect("register");

        // priority gap is 100 points; 11 active sessions on "busy"
        // out-penalize it
        for _ in 0..11 {
            manager
                .store
                .create("busy", &request(ContainerFormat::Mp4))
                .await
                .expect("create");
        }

        let selected = manager
            .select(&request(ContainerFormat::Mp4))
            .await
            .expect("select");
        assert_eq!(selected.info().id, "idle");
    }

    struct AccelProvider {
        id: &'static str,
        priority: i32,
        available: bool,
    }

    #[async_trait::async_trait]
    impl TranscodeProvider for AccelProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: self.id.to_string(),
                name: "Accelerated".to_string(),
                priority: self.priority,
                supported_formats: vec![ContainerFormat::Mp4],
                accelerators: vec![crate::provider::HardwareAccel {
                    kind: "vaapi".to_string(),
                    device: None,
                    available: self.available,
                }],
            }
        }

        async fn run(
            &self,
            _ctx: &crate::provider::JobContext,
        ) -> crate::Result<crate::provider::JobOutput> {
            Err(Error::Internal("not runnable in this test".to_string()))
        }
    }

    #[tokio::test]
    async fn test_hardware_bonus_flips_selection_only_when_preferred() {
        let manager = manager().await;
        manager
            .register(Arc::new(SyntheticProvider::new("software").with_priority(50)))
            .expect("register");
        manager
            .register(Arc::new(AccelProvider {
                id: "hw-vaapi",
                priority: 48,
                available: true,
            }))
            .expect("register");

        // Without the preference the higher base priority wins
        let mut req = request(ContainerFormat::Mp4);
        let selected = manager.select(&req).await.expect("select");
        assert_eq!(selected.info().id, "software");

        // Preference plus an available accelerator adds the bonus
        req.prefer_hardware = true;
        req.hardware_type = Some("vaapi".to_string());
        let selected = manager.select(&req).await.expect("select");
        assert_eq!(selected.info().id, "hw-vaapi");
    }

    #[tokio::test]
    async fn test_unavailable_accelerator_gets_no_bonus() {
        let manager = manager().await;
        manager
            .register(Arc::new(SyntheticProvider::new("software").with_priority(50)))
            .expect("register");
        manager
            .register(Arc::new(AccelProvider {
                id: "hw-vaapi",
                priority: 48,
                available: false,
            }))
            .expect("register");

        let mut req = request(ContainerFormat::Mp4);
        req.prefer_hardware = true;
        req.hardware_type = Some("vaapi".to_string());
        let selected = manager.select(&req).await.expect("select");
        assert_eq!(selected.info().id, "software");
    }

    #[tokio::test]
    async fn test_unregister_busy_provider_fails() {
        let manager = manager().await;
        manager
            .register(Arc::new(SyntheticProvider::new("a")))
            .expect("register");
        manager
            .store
            .create("a", &request(ContainerFormat::Mp4))
            .await
            .expect("create");

        assert!(matches!(
            manager.unregister("a").await,
            Err(Error::ProviderBusy(_))
        ));

        // After the session terminates, unregistering succeeds
        let sessions = manager
            .store
            .list_by_provider("a", &crate::models::SessionFilter::default())
            .await
            .expect("list");
        manager.store.cancel(sessions[0].id).await.expect("cancel");
        manager.unregister("a").await.expect("unregister");
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_list_sorted_by_priority_then_id() {
        let manager = manager().await;
        manager
            .register(Arc::new(SyntheticProvider::new("beta").with_priority(50)))
            .expect("register");
        manager
            .register(Arc::new(SyntheticProvider::new("alpha").with_priority(50)))
            .expect("register");
        manager
            .register(Arc::new(SyntheticProvider::new("top").with_priority(90)))
            .expect("register");

        let ids: Vec<String> = manager.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["top", "alpha", "beta"]);
    }
}
