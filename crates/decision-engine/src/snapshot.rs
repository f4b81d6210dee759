//! Versioned, immutable snapshots of managed entities.
//!
//! Readers take an `Arc<Snapshot<T>>` and evaluate against it for the whole
//! request, so a concurrent update is either fully visible or not at all.
//! Writers build a new snapshot and swap it in under a short write lock.

use crate::error::Result;
use crate::policy::Rule;
use crate::profile::{RiskProfile, ScoringRule};
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

/// Something the management surface can store, version and cache.
pub trait Entity: Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Kind name used in errors and logs.
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn version(&self) -> u64;

    fn is_enabled(&self) -> bool;

    fn validate(&self) -> Result<()>;

    /// Marks this value as the successor of `previous_version`.
    fn touch(&mut self, previous_version: u64);
}

impl Entity for Rule {
    const KIND: &'static str = "rule";

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn is_enabled(&self) -> bool {
        Rule::is_enabled(self)
    }

    fn validate(&self) -> Result<()> {
        Rule::validate(self)
    }

    fn touch(&mut self, previous_version: u64) {
        self.version = previous_version + 1;
        self.updated_at = Utc::now();
    }
}

impl Entity for ScoringRule {
    const KIND: &'static str = "scoring rule";

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn validate(&self) -> Result<()> {
        ScoringRule::validate(self)
    }

    fn touch(&mut self, previous_version: u64) {
        self.version = previous_version + 1;
        self.updated_at = Utc::now();
    }
}

impl Entity for RiskProfile {
    const KIND: &'static str = "risk profile";

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn validate(&self) -> Result<()> {
        RiskProfile::validate(self)
    }

    fn touch(&mut self, previous_version: u64) {
        self.version = previous_version + 1;
        self.updated_at = Utc::now();
    }
}

/// An immutable, ordered view of every entity at one point in time.
#[derive(Debug)]
pub struct Snapshot<T> {
    version: u64,
    items: Vec<Arc<T>>,
    taken_at: DateTime<Utc>,
}

impl<T: Entity> Snapshot<T> {
    fn new(version: u64, items: Vec<Arc<T>>) -> Self {
        Self {
            version,
            items,
            taken_at: Utc::now(),
        }
    }

    /// Monotonically increasing across swaps of the owning cache.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Items in insertion order.
    pub fn items(&self) -> &[Arc<T>] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&Arc<T>> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

/// Holds the current snapshot of one entity kind.
#[derive(Debug)]
pub struct SnapshotCache<T> {
    current: RwLock<Arc<Snapshot<T>>>,
}

impl<T: Entity> Default for SnapshotCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> SnapshotCache<T> {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::new(0, Vec::new()))),
        }
    }

    /// The snapshot in force right now.
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    /// Replaces everything. Returns the new snapshot version.
    pub fn replace(&self, items: Vec<T>) -> u64 {
        self.swap(|_| items.into_iter().map(Arc::new).collect())
    }

    /// Inserts or replaces one item; a new item goes to the end. An item
    /// older than the cached one is ignored, so racing writers cannot roll
    /// the cache back.
    pub fn upsert(&self, item: T) -> u64 {
        self.swap(|items| {
            let mut next = items.to_vec();
            let item = Arc::new(item);
            match next.iter().position(|existing| existing.id() == item.id()) {
                Some(index) if next[index].version() > item.version() => {}
                Some(index) => next[index] = item,
                None => next.push(item),
            }
            next
        })
    }

    /// Removes one item. Returns false if it was not present.
    pub fn remove(&self, id: &str) -> bool {
        let mut removed = false;
        self.swap(|items| {
            let next: Vec<Arc<T>> = items.iter().filter(|item| item.id() != id).cloned().collect();
            removed = next.len() != items.len();
            next
        });
        removed
    }

    fn swap(&self, build: impl FnOnce(&[Arc<T>]) -> Vec<Arc<T>>) -> u64 {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let version = guard.version() + 1;
        let items = build(guard.items());
        *guard = Arc::new(Snapshot::new(version, items));
        version
    }
}
