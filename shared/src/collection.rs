//! Tag-indexed, persisted recipe collections.
//!
//! One generic store backs both History (bounded, touch moves to front) and
//! SavedItems (unbounded, first insert wins). Every mutation lands in memory
//! first; the store then mirrors the newest state to its namespace key.
//! Persistence failures are logged and counted, never returned.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{KeyValueStore, KvError, TypedKvStore};
use crate::config::{CollectionConfig, ConfigError};
use crate::model::{tag_matches, IdentityKey, Recipe};

pub const SCHEMA_VERSION: u32 = 1;

/// Items a collection can hold: identifiable and carrying a mutable tag list.
pub trait Taggable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn identity(&self) -> IdentityKey;
    fn tags(&self) -> &[String];
    fn tags_mut(&mut self) -> &mut Vec<String>;
}

impl Taggable for Recipe {
    fn identity(&self) -> IdentityKey {
        Recipe::identity(self)
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn tags_mut(&mut self) -> &mut Vec<String> {
        &mut self.tags
    }
}

/// What happens when an item with an existing identity is inserted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPolicy {
    /// Replace the old occurrence and put the new item first.
    MoveToFront,
    /// The stored item wins; new items are appended.
    KeepExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    MovedToFront,
    Ignored,
}

pub type History = TaggedCollectionStore<Recipe>;
pub type SavedItems = TaggedCollectionStore<Recipe>;

// ============================================================================
// Persistence format
// ============================================================================

#[derive(Serialize, Deserialize)]
struct CollectionEnvelope<T> {
    schema_version: u32,
    items: Vec<T>,
}

/// Older builds wrote the bare item array.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredCollection<T> {
    Envelope(CollectionEnvelope<T>),
    Legacy(Vec<T>),
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct CollectionMetrics {
    pub persists_succeeded: AtomicU64,
    pub persists_failed: AtomicU64,
    /// Persist requests already covered by a newer write.
    pub persists_coalesced: AtomicU64,
    pub load_failures: AtomicU64,
    pub evictions: AtomicU64,
}

impl CollectionMetrics {
    pub fn snapshot(&self) -> CollectionMetricsSnapshot {
        CollectionMetricsSnapshot {
            persists_succeeded: self.persists_succeeded.load(Ordering::Relaxed),
            persists_failed: self.persists_failed.load(Ordering::Relaxed),
            persists_coalesced: self.persists_coalesced.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionMetricsSnapshot {
    pub persists_succeeded: u64,
    pub persists_failed: u64,
    pub persists_coalesced: u64,
    pub load_failures: u64,
    pub evictions: u64,
}

impl CollectionMetricsSnapshot {
    /// Share of attempted writes that failed, in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn persist_failure_rate(&self) -> f64 {
        let attempts = self.persists_succeeded + self.persists_failed;
        if attempts == 0 {
            return 0.0;
        }
        self.persists_failed as f64 / attempts as f64
    }
}

// ============================================================================
// Store
// ============================================================================

struct CollectionState<T> {
    items: Vec<T>,
    revision: u64,
}

pub struct TaggedCollectionStore<T: Taggable> {
    config: CollectionConfig,
    store: Arc<dyn KeyValueStore>,
    typed: TypedKvStore<StoredCollection<T>>,
    state: RwLock<CollectionState<T>>,
    /// Highest revision known to be on disk. Held across a write so persists
    /// run one at a time.
    persisted_revision: Mutex<u64>,
    metrics: CollectionMetrics,
}

impl<T: Taggable> TaggedCollectionStore<T> {
    /// Hydrates the collection from its namespace key.
    ///
    /// Unreadable data is logged and replaced with an empty collection.
    #[instrument(skip(store, config), fields(namespace = %config.namespace))]
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        config: CollectionConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let key = config
            .storage_key()
            .map_err(|e| ConfigError::Invalid {
                field: "namespace",
                reason: e.to_string(),
            })?;
        let typed = TypedKvStore::new(key);
        let metrics = CollectionMetrics::default();

        let loaded = match typed.load(store.as_ref()).await {
            Ok(Some(StoredCollection::Envelope(envelope))) => {
                if envelope.schema_version > SCHEMA_VERSION {
                    warn!(
                        schema_version = envelope.schema_version,
                        "collection written by a newer schema, reading best effort"
                    );
                }
                envelope.items
            }
            Ok(Some(StoredCollection::Legacy(items))) => {
                info!(count = items.len(), "migrating legacy collection array");
                items
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                metrics.load_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "could not read collection, starting empty");
                Vec::new()
            }
        };

        let items = sanitize_loaded(loaded, &config, &metrics);
        info!(count = items.len(), "collection loaded");

        Ok(Self {
            config,
            store,
            typed,
            state: RwLock::new(CollectionState { items, revision: 0 }),
            persisted_revision: Mutex::new(0),
            metrics,
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.config.capacity
    }

    pub fn metrics(&self) -> CollectionMetricsSnapshot {
        self.metrics.snapshot()
    }

    // --- Mutations ---

    #[instrument(skip(self, item), fields(namespace = %self.config.namespace, key = %item.identity()))]
    pub async fn insert(&self, item: T) -> InsertOutcome {
        let outcome = self.mutate(self.insert_op(item)).await;
        debug!(?outcome, "insert");
        outcome
    }

    /// Like [`Self::insert`], but the write to storage runs on a spawned
    /// task. Returns once the in-memory collection has changed.
    #[instrument(skip(self, item), fields(namespace = %self.config.namespace, key = %item.identity()))]
    pub async fn insert_detached(self: &Arc<Self>, item: T) -> InsertOutcome {
        let (outcome, revision) = self.apply(self.insert_op(item)).await;
        if let Some(revision) = revision {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.persist(revision).await });
        }
        debug!(?outcome, "insert, persisting in background");
        outcome
    }

    fn insert_op(&self, item: T) -> impl FnOnce(&mut Vec<T>) -> (InsertOutcome, bool) + '_ {
        let policy = self.config.policy;
        let capacity = self.config.capacity;
        let metrics = &self.metrics;

        move |items| {
            let key = item.identity();
            let existing = items.iter().position(|i| i.identity() == key);

            let outcome = match (policy, existing) {
                (InsertPolicy::KeepExisting, Some(_)) => return (InsertOutcome::Ignored, false),
                (InsertPolicy::MoveToFront, Some(pos)) => {
                    items.remove(pos);
                    items.insert(0, item);
                    InsertOutcome::MovedToFront
                }
                (InsertPolicy::MoveToFront, None) => {
                    items.insert(0, item);
                    InsertOutcome::Inserted
                }
                (InsertPolicy::KeepExisting, None) => {
                    items.push(item);
                    InsertOutcome::Inserted
                }
            };

            let evicted = enforce_capacity(items, capacity, policy);
            if evicted > 0 {
                metrics.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                debug!(evicted, "capacity reached, evicted oldest items");
            }
            (outcome, true)
        }
    }

    /// Removes the item with `key`. Returns whether anything was removed.
    pub async fn remove(&self, key: &IdentityKey) -> bool {
        self.mutate(|items| {
            let before = items.len();
            items.retain(|i| i.identity() != *key);
            let removed = items.len() != before;
            (removed, removed)
        })
        .await
    }

    /// Appends `tag` unless the item already has it under any casing.
    pub async fn add_tag(&self, key: &IdentityKey, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() {
            return false;
        }
        self.mutate(|items| {
            let Some(item) = items.iter_mut().find(|i| i.identity() == *key) else {
                return (false, false);
            };
            if item.tags().iter().any(|t| tag_matches(t, tag)) {
                return (false, false);
            }
            item.tags_mut().push(tag.to_string());
            (true, true)
        })
        .await
    }

    /// Removes occurrences of `tag`. Surrounding whitespace is ignored on
    /// both sides, like [`Self::add_tag`], but casing must match exactly.
    pub async fn remove_tag(&self, key: &IdentityKey, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() {
            return false;
        }
        self.mutate(|items| {
            let Some(item) = items.iter_mut().find(|i| i.identity() == *key) else {
                return (false, false);
            };
            let tags = item.tags_mut();
            let before = tags.len();
            tags.retain(|t| t.trim() != tag);
            let changed = tags.len() != before;
            (changed, changed)
        })
        .await
    }

    /// Replaces the tag list verbatim. No dedup is applied.
    pub async fn set_tags(&self, key: &IdentityKey, tags: Vec<String>) -> bool {
        self.mutate(|items| {
            let Some(item) = items.iter_mut().find(|i| i.identity() == *key) else {
                return (false, false);
            };
            *item.tags_mut() = tags;
            (true, true)
        })
        .await
    }

    pub async fn clear(&self) {
        self.mutate(|items| {
            let changed = !items.is_empty();
            items.clear();
            ((), changed)
        })
        .await;
    }

    /// Waits until every change made so far has been written, or its write
    /// has failed.
    pub async fn flush(&self) {
        let revision = self.state.read().await.revision;
        self.persist(revision).await;
    }

    // --- Queries ---

    pub async fn items(&self) -> Vec<T> {
        self.state.read().await.items.clone()
    }

    pub async fn get(&self, key: &IdentityKey) -> Option<T> {
        self.state
            .read()
            .await
            .items
            .iter()
            .find(|i| i.identity() == *key)
            .cloned()
    }

    pub async fn contains(&self, key: &IdentityKey) -> bool {
        self.state
            .read()
            .await
            .items
            .iter()
            .any(|i| i.identity() == *key)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.items.is_empty()
    }

    /// Union of every item's tags in first-seen order.
    ///
    /// Dedup here is case-sensitive, unlike [`Self::add_tag`]: "Dinner" and
    /// "dinner" on two different items are both listed.
    pub async fn all_tags(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for tag in state.items.iter().flat_map(|i| i.tags().iter()) {
            if seen.insert(tag.as_str()) {
                out.push(tag.clone());
            }
        }
        out
    }

    /// Items carrying every requested tag (case-insensitive AND).
    /// An empty query returns the whole collection.
    pub async fn by_tags<S: AsRef<str>>(&self, tags: &[S]) -> Vec<T> {
        let state = self.state.read().await;
        state
            .items
            .iter()
            .filter(|item| matches_all(item.tags(), tags))
            .cloned()
            .collect()
    }

    // --- Internals ---

    /// Applies `op` under the write lock, then writes the result to storage.
    async fn mutate<R, F>(&self, op: F) -> R
    where
        F: FnOnce(&mut Vec<T>) -> (R, bool),
    {
        let (result, revision) = self.apply(op).await;
        if let Some(revision) = revision {
            self.persist(revision).await;
        }
        result
    }

    /// `op` reports whether it changed anything; only changes bump the
    /// revision, which is returned for persisting.
    async fn apply<R, F>(&self, op: F) -> (R, Option<u64>)
    where
        F: FnOnce(&mut Vec<T>) -> (R, bool),
    {
        let mut state = self.state.write().await;
        let (result, changed) = op(&mut state.items);
        if !changed {
            return (result, None);
        }
        state.revision += 1;
        (result, Some(state.revision))
    }

    /// Writes the newest in-memory state if `requested` is not yet on disk.
    async fn persist(&self, requested: u64) {
        let mut persisted = self.persisted_revision.lock().await;
        if *persisted >= requested {
            self.metrics.persists_coalesced.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let (revision, items) = {
            let state = self.state.read().await;
            (state.revision, state.items.clone())
        };
        let stored = StoredCollection::Envelope(CollectionEnvelope {
            schema_version: SCHEMA_VERSION,
            items,
        });

        match self.typed.save(self.store.as_ref(), &stored).await {
            Ok(()) => {
                *persisted = revision;
                self.metrics.persists_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.metrics.persists_failed.fetch_add(1, Ordering::Relaxed);
                log_persist_failure(&self.config.namespace, revision, &e);
            }
        }
    }
}

fn log_persist_failure(namespace: &str, revision: u64, e: &KvError) {
    warn!(
        namespace,
        revision,
        retryable = e.is_retryable(),
        error = %e,
        "collection persist failed, in-memory state kept"
    );
}

fn matches_all<S: AsRef<str>>(item_tags: &[String], query: &[S]) -> bool {
    query
        .iter()
        .all(|q| item_tags.iter().any(|t| tag_matches(t, q.as_ref())))
}

/// Drops the least-recently-touched items past `capacity`. Returns how many.
fn enforce_capacity<T>(items: &mut Vec<T>, capacity: Option<usize>, policy: InsertPolicy) -> usize {
    let Some(capacity) = capacity else {
        return 0;
    };
    let excess = items.len().saturating_sub(capacity);
    if excess == 0 {
        return 0;
    }
    match policy {
        InsertPolicy::MoveToFront => items.truncate(capacity),
        InsertPolicy::KeepExisting => {
            items.drain(..excess);
        }
    }
    excess
}

fn sanitize_loaded<T: Taggable>(
    loaded: Vec<T>,
    config: &CollectionConfig,
    metrics: &CollectionMetrics,
) -> Vec<T> {
    let total = loaded.len();
    let mut seen = HashSet::new();
    let mut items: Vec<T> = loaded
        .into_iter()
        .filter(|i| seen.insert(i.identity()))
        .collect();

    let duplicates = total - items.len();
    if duplicates > 0 {
        warn!(duplicates, "dropped duplicate identities from stored collection");
    }

    let evicted = enforce_capacity(&mut items, config.capacity, config.policy);
    if evicted > 0 {
        metrics.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        warn!(evicted, "stored collection exceeded capacity");
    }
    items
}
