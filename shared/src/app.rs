//! Wires the client-state services together and routes lifecycle events.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::capabilities::{ConnectivityProbe, ImagePipeline, KeyValueStore, RecipeGenerator};
use crate::collection::{History, InsertOutcome, SavedItems};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::event::LifecycleEvent;
use crate::generation::{GenerationSnapshot, RecipeGenerationController};
use crate::image_cache::ImageCache;
use crate::network::NetworkStatusMonitor;
use crate::UnixTimeMs;

/// Platform services handed over by the shell at startup.
#[derive(Clone)]
pub struct CoreCapabilities {
    pub kv: Arc<dyn KeyValueStore>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub images: Arc<dyn ImagePipeline>,
    pub generator: Arc<dyn RecipeGenerator>,
}

pub struct RecipeCore {
    network: Arc<NetworkStatusMonitor>,
    history: Arc<History>,
    saved: Arc<SavedItems>,
    images: Arc<ImageCache>,
    generation: Arc<RecipeGenerationController>,
}

impl RecipeCore {
    /// Validates config, hydrates both collections, probes connectivity and
    /// runs the daily disk sweep check.
    #[instrument(skip_all)]
    pub async fn bootstrap(caps: CoreCapabilities, config: CoreConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let network = NetworkStatusMonitor::start(caps.probe, config.network).await;
        let history = Arc::new(History::load(Arc::clone(&caps.kv), config.history).await?);
        let saved = Arc::new(SavedItems::load(Arc::clone(&caps.kv), config.saved).await?);
        let images = Arc::new(ImageCache::new(caps.images, caps.kv, config.image_cache)?);
        let generation = Arc::new(RecipeGenerationController::new(
            caps.generator,
            Arc::clone(&network),
            Arc::clone(&history),
            config.generation,
        ));

        images.maybe_sweep_disk(UnixTimeMs::now()).await;

        info!(
            offline = network.is_offline(),
            history = history.len().await,
            saved = saved.len().await,
            "recipe core ready"
        );

        Ok(Self {
            network,
            history,
            saved,
            images,
            generation,
        })
    }

    #[must_use]
    pub fn network(&self) -> &Arc<NetworkStatusMonitor> {
        &self.network
    }

    #[must_use]
    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    #[must_use]
    pub fn saved(&self) -> &Arc<SavedItems> {
        &self.saved
    }

    #[must_use]
    pub fn images(&self) -> &Arc<ImageCache> {
        &self.images
    }

    #[must_use]
    pub fn generation(&self) -> &Arc<RecipeGenerationController> {
        &self.generation
    }

    #[instrument(skip(self), fields(event = event.name()))]
    pub async fn handle_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::AppStarted | LifecycleEvent::AppForegrounded => {
                self.network.refresh().await;
                self.images.maybe_sweep_disk(UnixTimeMs::now()).await;
            }
            LifecycleEvent::AppBackgrounded => {
                self.images.clear_memory().await;
                self.flush().await;
            }
            LifecycleEvent::ConnectivityChanged { result } => {
                self.network.handle_platform_change(result);
            }
        }
    }

    /// Starts a generation and warms the new recipe's images on success.
    pub async fn generate(&self, ingredients: Vec<String>) -> GenerationSnapshot {
        let snapshot = self.generation.start(ingredients).await;
        self.prefetch_new_recipe(&snapshot);
        snapshot
    }

    pub async fn retry(&self) -> GenerationSnapshot {
        let snapshot = self.generation.retry().await;
        self.prefetch_new_recipe(&snapshot);
        snapshot
    }

    /// Adds the current recipe to SavedItems. `None` when there is none.
    pub async fn save_current(&self) -> Option<InsertOutcome> {
        let recipe = self.generation.snapshot().current_recipe?;
        Some(self.saved.insert(recipe).await)
    }

    /// Waits for pending collection writes to reach storage.
    pub async fn flush(&self) {
        self.history.flush().await;
        self.saved.flush().await;
    }

    fn prefetch_new_recipe(&self, snapshot: &GenerationSnapshot) {
        if !snapshot.has_new_item || snapshot.error.is_some() || snapshot.is_generating() {
            return;
        }
        if let Some(recipe) = &snapshot.current_recipe {
            self.images.prefetch(recipe.image_uris());
        }
    }
}
