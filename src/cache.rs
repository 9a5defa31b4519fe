//! Request cache shared by the queries of one dashboard session.
//!
//! Each key owns at most one in-flight fetch. Starting a fetch hands out a
//! [`FetchTicket`] tagged with a generation; a completion is applied only if
//! the entry still carries that generation. Invalidating a key bumps it out of
//! the map, so late arrivals for abandoned keys are dropped on the floor.

use crate::models::Period;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Roster,
    SiteMetrics { site_id: i64, period: Period },
}

impl QueryKey {
    pub fn metrics(site_id: i64, period: Period) -> Self {
        QueryKey::SiteMetrics { site_id, period }
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryKey::Roster => write!(f, "roster"),
            QueryKey::SiteMetrics { site_id, period } => write!(f, "site-metrics/{}/{}", site_id, period),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub data: Option<V>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub is_fetching: bool,
    pub is_error: bool,
    pub error: Option<String>,
    generation: u64,
}

impl<V> CacheEntry<V> {
    fn pending(generation: u64) -> Self {
        Self {
            data: None,
            fetched_at: None,
            is_fetching: true,
            is_error: false,
            error: None,
            generation,
        }
    }

    /// Fetching with nothing to show yet
    pub fn is_loading(&self) -> bool {
        self.is_fetching && self.data.is_none()
    }
}

/// Proof that a fetch was issued for `key` at a given generation
#[derive(Debug)]
pub struct FetchTicket {
    key: QueryKey,
    generation: u64,
}

impl FetchTicket {
    pub fn key(&self) -> QueryKey {
        self.key
    }
}

/// Cache context for one value type. Clones share the same map.
#[derive(Debug)]
pub struct QueryCache<V> {
    entries: Arc<RwLock<HashMap<QueryKey, CacheEntry<V>>>>,
    consumers: Arc<Mutex<HashMap<QueryKey, usize>>>,
    next_generation: Arc<AtomicU64>,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            consumers: Arc::clone(&self.consumers),
            next_generation: Arc::clone(&self.next_generation),
        }
    }
}

impl<V> Default for QueryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> QueryCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            consumers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start a fetch for `key`. Returns `None` when one is already in flight.
    pub fn begin(&self, key: QueryKey) -> Option<FetchTicket> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        match entries.get_mut(&key) {
            Some(entry) if entry.is_fetching => {
                debug!("Coalescing fetch for {} into in-flight generation {}", key, entry.generation);
                return None;
            }
            Some(entry) => {
                entry.is_fetching = true;
                entry.generation = generation;
            }
            None => {
                entries.insert(key, CacheEntry::pending(generation));
            }
        }

        Some(FetchTicket { key, generation })
    }

    /// Apply a successful result. Returns false if the ticket went stale.
    pub fn resolve(&self, ticket: FetchTicket, data: V) -> bool {
        self.complete(ticket, |entry| {
            entry.data = Some(data);
            entry.fetched_at = Some(Utc::now());
            entry.is_error = false;
            entry.error = None;
        })
    }

    /// Record a failure, keeping the last good data. Returns false if stale.
    pub fn reject(&self, ticket: FetchTicket, message: String) -> bool {
        self.complete(ticket, |entry| {
            entry.is_error = true;
            entry.error = Some(message);
        })
    }

    fn complete<F>(&self, ticket: FetchTicket, apply: F) -> bool
    where
        F: FnOnce(&mut CacheEntry<V>),
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        match entries.get_mut(&ticket.key) {
            Some(entry) if entry.generation == ticket.generation && entry.is_fetching => {
                entry.is_fetching = false;
                apply(entry);
                true
            }
            _ => {
                debug!(
                    "Discarding stale response for {} (generation {})",
                    ticket.key, ticket.generation
                );
                false
            }
        }
    }

    /// Drop the entry; any in-flight ticket for it becomes stale
    pub fn invalidate(&self, key: QueryKey) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(&key).is_some() {
            debug!("Invalidated {}", key);
        }
    }

    /// Register a mounted consumer of `key`
    pub fn retain(&self, key: QueryKey) {
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        *consumers.entry(key).or_insert(0) += 1;
    }

    /// Unregister a consumer of `key`; the last one out invalidates the entry.
    /// Returns true if the entry was invalidated.
    pub fn release(&self, key: QueryKey) -> bool {
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        match consumers.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                debug!("{} still has {} consumers", key, count);
                false
            }
            _ => {
                consumers.remove(&key);
                drop(consumers);
                self.invalidate(key);
                true
            }
        }
    }

    pub fn consumers(&self, key: QueryKey) -> usize {
        let consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        consumers.get(&key).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: QueryKey) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl<V: Clone> QueryCache<V> {
    pub fn get(&self, key: QueryKey) -> Option<CacheEntry<V>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&key).cloned()
    }
}
