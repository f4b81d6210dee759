//! Rule storage: the repository seam and the snapshot-backed store on top.
//!
//! The repository is the system of record. The store mirrors it into a
//! [`SnapshotCache`] that the evaluation path reads without touching the
//! repository. Management writes go to the repository first and update the
//! cache only once the write succeeded.

use crate::audit;
use crate::error::{EngineError, Result};
use crate::policy::Rule;
use crate::profile::{RiskProfile, ScoringRule};
use crate::snapshot::{Entity, Snapshot, SnapshotCache};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// Criteria for listing entities. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub enabled_only: bool,
    pub ids: Vec<String>,
    /// Case-insensitive substring of the name.
    pub name_contains: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled_only(mut self) -> Self {
        self.enabled_only = true;
        self
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_name(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into());
        self
    }

    pub fn matches<T: Entity>(&self, item: &T) -> bool {
        if self.enabled_only && !item.is_enabled() {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.iter().any(|id| id == item.id()) {
            return false;
        }
        match &self.name_contains {
            Some(fragment) => item
                .name()
                .to_lowercase()
                .contains(&fragment.to_lowercase()),
            None => true,
        }
    }
}

/// Persistent storage for one entity kind.
///
/// Listing returns entities in insertion order; tie-breaking between rules
/// of equal priority relies on it.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync + Debug {
    async fn get(&self, id: &str) -> Result<Option<T>>;

    async fn list(&self, filter: &Filter) -> Result<Vec<T>>;

    /// Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, item: T) -> Result<T>;

    /// Replaces the stored entity and stamps it as the successor of the
    /// stored version, as one atomic step. Returns what was written.
    /// Fails with `NotFound` if the id is unknown.
    async fn update(&self, item: T) -> Result<T>;

    /// Fails with `NotFound` if the id is unknown.
    async fn delete(&self, id: &str) -> Result<()>;

    async fn count(&self) -> Result<usize> {
        Ok(self.list(&Filter::new()).await?.len())
    }
}

/// Repository kept in process memory.
#[derive(Debug)]
pub struct InMemoryRepository<T> {
    items: RwLock<Vec<T>>,
    unavailable: AtomicBool,
}

impl<T: Entity> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self::with_items(Vec::new())
    }

    pub fn with_items(items: Vec<T>) -> Self {
        Self {
            items: RwLock::new(items),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every call fail with a store error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(EngineError::Store(format!("{} repository unavailable", T::KIND)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<T: Entity + Debug> Repository<T> for InMemoryRepository<T> {
    async fn get(&self, id: &str) -> Result<Option<T>> {
        self.check_available()?;
        let items = self.items.read().await;
        Ok(items.iter().find(|item| item.id() == id).cloned())
    }

    async fn list(&self, filter: &Filter) -> Result<Vec<T>> {
        self.check_available()?;
        let items = self.items.read().await;
        Ok(items.iter().filter(|item| filter.matches(*item)).cloned().collect())
    }

    async fn create(&self, item: T) -> Result<T> {
        self.check_available()?;
        let mut items = self.items.write().await;
        if items.iter().any(|existing| existing.id() == item.id()) {
            return Err(EngineError::AlreadyExists {
                kind: T::KIND,
                id: item.id().to_string(),
            });
        }
        items.push(item.clone());
        Ok(item)
    }

    async fn update(&self, mut item: T) -> Result<T> {
        self.check_available()?;
        let mut items = self.items.write().await;
        let slot = items
            .iter_mut()
            .find(|existing| existing.id() == item.id())
            .ok_or_else(|| EngineError::not_found(T::KIND, item.id()))?;
        item.touch(slot.version());
        *slot = item.clone();
        Ok(item)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_available()?;
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|item| item.id() != id);
        if items.len() == before {
            return Err(EngineError::not_found(T::KIND, id));
        }
        Ok(())
    }
}

/// Repository plus the snapshot the evaluation path reads.
#[derive(Debug)]
pub struct EntityStore<T: Entity> {
    repository: Arc<dyn Repository<T>>,
    cache: SnapshotCache<T>,
}

/// Store for policy, compliance or classification rules.
pub type RuleStore = EntityStore<Rule>;

/// Store for scoring rules.
pub type ScoringRuleStore = EntityStore<ScoringRule>;

/// Store for risk profiles.
pub type ProfileStore = EntityStore<RiskProfile>;

impl<T: Entity + Debug> EntityStore<T> {
    /// Creates a store with an empty snapshot. Call [`load`](Self::load)
    /// before serving.
    pub fn new(repository: Arc<dyn Repository<T>>) -> Self {
        Self {
            repository,
            cache: SnapshotCache::new(),
        }
    }

    /// Creates a store over a fresh in-memory repository.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRepository::new()))
    }

    pub fn repository(&self) -> &Arc<dyn Repository<T>> {
        &self.repository
    }

    /// The snapshot evaluation should run against.
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        self.cache.snapshot()
    }

    /// Initial load. A failure here means the service cannot start.
    pub async fn load(&self) -> Result<Arc<Snapshot<T>>> {
        let items = self.repository.list(&Filter::new()).await?;
        let count = items.len();
        let version = self.cache.replace(items);
        tracing::info!(kind = T::KIND, count, version, "Snapshot loaded");
        Ok(self.cache.snapshot())
    }

    /// Reloads from the repository. On failure the current snapshot stays
    /// in force and the error is returned after being logged.
    pub async fn refresh(&self) -> Result<u64> {
        match self.repository.list(&Filter::new()).await {
            Ok(items) => {
                let count = items.len();
                let version = self.cache.replace(items);
                tracing::debug!(kind = T::KIND, count, version, "Snapshot refreshed");
                Ok(version)
            }
            Err(err) => {
                tracing::warn!(
                    kind = T::KIND,
                    version = self.cache.version(),
                    error = %err,
                    "Refresh failed; keeping stale snapshot"
                );
                Err(err)
            }
        }
    }

    /// Refreshes every `period` until `shutdown` turns true or its sender
    /// is dropped.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; the caller already loaded.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = store.refresh().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!(kind = T::KIND, "Refresh loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn get(&self, id: &str) -> Result<T> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(T::KIND, id))
    }

    pub async fn list(&self, filter: &Filter) -> Result<Vec<T>> {
        self.repository.list(filter).await
    }

    /// Validates and stores a new entity.
    pub async fn create(&self, item: T) -> Result<T> {
        item.validate()?;
        let created = self.repository.create(item).await?;
        self.cache.upsert(created.clone());
        audit::emit_entity_change(T::KIND, created.id(), Some(created.version()), "create");
        Ok(created)
    }

    /// Validates and replaces an existing entity. The repository bumps the
    /// version, so concurrent updates get distinct versions.
    pub async fn update(&self, item: T) -> Result<T> {
        item.validate()?;
        let updated = self.repository.update(item).await?;
        self.cache.upsert(updated.clone());
        audit::emit_entity_change(T::KIND, updated.id(), Some(updated.version()), "update");
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.repository.delete(id).await?;
        self.cache.remove(id);
        audit::emit_entity_change(T::KIND, id, None, "delete");
        Ok(())
    }

    /// Creates, or updates when the id exists and `overwrite` is set.
    /// Returns `Ok(false)` when the entity existed and was left alone.
    pub async fn put(&self, item: T, overwrite: bool) -> Result<bool> {
        match self.repository.get(item.id()).await? {
            None => self.create(item).await.map(|_| true),
            Some(_) if overwrite => self.update(item).await.map(|_| true),
            Some(_) => Ok(false),
        }
    }
}
