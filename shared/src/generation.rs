//! Single-flight recipe generation.
//!
//! `Idle -> Generating -> Idle`, with the outcome left in the snapshot: a new
//! current recipe and `has_new_item` on success, an error on failure. Every
//! success with a new identity is written to History before it is published.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::RecipeGenerator;
use crate::collection::History;
use crate::config::GenerationConfig;
use crate::error::{RecipeError, RecipeErrorKind};
use crate::model::Recipe;
use crate::network::NetworkStatusMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    #[default]
    Idle,
    Generating,
}

/// Input of the most recent attempt, kept for `retry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRequest {
    pub ingredients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationSnapshot {
    pub state: GenerationState,
    pub current_recipe: Option<Recipe>,
    pub error: Option<RecipeError>,
    pub has_new_item: bool,
    pub last_request: Option<LastRequest>,
}

impl GenerationSnapshot {
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.state == GenerationState::Generating
    }
}

#[derive(Debug, Default)]
pub struct GenerationMetrics {
    pub attempts: AtomicU64,
    /// `start` calls refused because a request was already in flight.
    pub rejected: AtomicU64,
    /// Attempts failed by the offline gate without calling the generator.
    pub gated: AtomicU64,
    pub successes: AtomicU64,
    /// Successes whose recipe matched the current one.
    pub unchanged: AtomicU64,
    failures: [AtomicU64; 5],
}

impl GenerationMetrics {
    fn record_failure(&self, kind: RecipeErrorKind) {
        self.failures[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GenerationMetricsSnapshot {
        GenerationMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            gated: self.gated.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            failures: std::array::from_fn(|i| self.failures[i].load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationMetricsSnapshot {
    pub attempts: u64,
    pub rejected: u64,
    pub gated: u64,
    pub successes: u64,
    pub unchanged: u64,
    failures: [u64; 5],
}

impl GenerationMetricsSnapshot {
    #[must_use]
    pub fn failures(&self, kind: RecipeErrorKind) -> u64 {
        self.failures[kind.index()]
    }

    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.failures.iter().sum()
    }
}

pub struct RecipeGenerationController {
    generator: Arc<dyn RecipeGenerator>,
    network: Arc<NetworkStatusMonitor>,
    history: Arc<History>,
    config: GenerationConfig,
    state: watch::Sender<GenerationSnapshot>,
    metrics: GenerationMetrics,
}

impl RecipeGenerationController {
    pub fn new(
        generator: Arc<dyn RecipeGenerator>,
        network: Arc<NetworkStatusMonitor>,
        history: Arc<History>,
        config: GenerationConfig,
    ) -> Self {
        let (state, _) = watch::channel(GenerationSnapshot::default());
        Self {
            generator,
            network,
            history,
            config,
            state,
            metrics: GenerationMetrics::default(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> GenerationSnapshot {
        self.state.borrow().clone()
    }

    /// Observers are woken only by real changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<GenerationSnapshot> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> GenerationMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs one generation attempt and returns the resulting snapshot.
    ///
    /// A call made while another attempt is in flight is ignored and returns
    /// the current snapshot unchanged.
    #[instrument(skip(self, ingredients), fields(count = ingredients.len()))]
    pub async fn start(&self, ingredients: Vec<String>) -> GenerationSnapshot {
        let request = LastRequest {
            ingredients: ingredients.clone(),
        };
        let started = self.state.send_if_modified(|s| {
            if s.is_generating() {
                return false;
            }
            s.state = GenerationState::Generating;
            s.error = None;
            s.last_request = Some(request);
            true
        });
        if !started {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("generation already in flight, ignoring start");
            return self.snapshot();
        }
        self.metrics.attempts.fetch_add(1, Ordering::Relaxed);

        let mut guard = InFlight::new(&self.state);
        match self.attempt(ingredients).await {
            Ok(recipe) => self.succeed(recipe).await,
            Err(error) => self.fail(error),
        }
        guard.disarm();

        self.snapshot()
    }

    /// Replays the last request. A no-op when nothing has been attempted yet.
    pub async fn retry(&self) -> GenerationSnapshot {
        let last = self.state.borrow().last_request.clone();
        match last {
            Some(request) => {
                info!("retrying last generation request");
                self.start(request.ingredients).await
            }
            None => {
                debug!("retry without a previous request");
                self.snapshot()
            }
        }
    }

    pub fn mark_viewed(&self) {
        self.state.send_if_modified(|s| std::mem::take(&mut s.has_new_item));
    }

    pub fn dismiss_error(&self) {
        self.state.send_if_modified(|s| s.error.take().is_some());
    }

    async fn attempt(&self, ingredients: Vec<String>) -> Result<Recipe, RecipeError> {
        if self.network.is_offline() {
            self.metrics.gated.fetch_add(1, Ordering::Relaxed);
            return Err(RecipeError::new(RecipeErrorKind::Network)
                .with_details("device is offline, request not sent"));
        }

        let ingredients = self.validate(ingredients)?;
        let payload = self
            .generator
            .generate(&ingredients)
            .await
            .map_err(RecipeError::from)?;
        Ok(Recipe::from_generated(payload)?)
    }

    fn validate(&self, ingredients: Vec<String>) -> Result<Vec<String>, RecipeError> {
        let ingredients: Vec<String> = ingredients
            .into_iter()
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .collect();

        if ingredients.is_empty() {
            return Err(invalid_input("no ingredients provided".to_string()));
        }
        if ingredients.len() > self.config.max_ingredients {
            return Err(invalid_input(format!(
                "{} ingredients exceeds the limit of {}",
                ingredients.len(),
                self.config.max_ingredients
            )));
        }
        if let Some(long) = ingredients
            .iter()
            .find(|i| i.len() > self.config.max_ingredient_len)
        {
            return Err(invalid_input(format!(
                "ingredient of {} bytes exceeds the limit of {}",
                long.len(),
                self.config.max_ingredient_len
            )));
        }
        Ok(ingredients)
    }

    async fn succeed(&self, recipe: Recipe) {
        self.metrics.successes.fetch_add(1, Ordering::Relaxed);

        let identity = recipe.identity();
        let is_new = self
            .state
            .borrow()
            .current_recipe
            .as_ref()
            .is_none_or(|current| current.identity() != identity);

        if !is_new {
            self.metrics.unchanged.fetch_add(1, Ordering::Relaxed);
            debug!(key = %identity, "generated recipe matches current one");
            self.state.send_modify(|s| s.state = GenerationState::Idle);
            return;
        }

        // In memory before publishing; the write to storage runs behind.
        self.history.insert_detached(recipe.clone()).await;
        info!(key = %identity, "generated new recipe");
        self.state.send_modify(|s| {
            s.state = GenerationState::Idle;
            s.current_recipe = Some(recipe);
            s.has_new_item = true;
        });
    }

    fn fail(&self, error: RecipeError) {
        self.metrics.record_failure(error.kind);
        warn!(kind = %error.kind, details = ?error.details, "generation failed");
        self.state.send_modify(|s| {
            s.state = GenerationState::Idle;
            s.error = Some(error);
        });
    }
}

fn invalid_input(details: String) -> RecipeError {
    RecipeError::new(RecipeErrorKind::Validation).with_details(details)
}

/// Returns the controller to `Idle` if an attempt's future is dropped
/// before it finishes.
struct InFlight<'a> {
    state: &'a watch::Sender<GenerationSnapshot>,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(state: &'a watch::Sender<GenerationSnapshot>) -> Self {
        Self { state, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("generation attempt dropped while in flight");
            self.state.send_modify(|s| {
                s.state = GenerationState::Idle;
                s.error = Some(
                    RecipeError::new(RecipeErrorKind::Unknown).with_details("generation cancelled"),
                );
            });
        }
    }
}
