// Secure two-level cache
// Small token-validation region plus a larger data region (permissions,
// roles, session snapshots, user info). LRU-capped, per-entry TTL,
// fail-open: every internal error degrades to a cache miss.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::app_config::CacheSettings;
use crate::db::kv::glob_match;
use crate::utils::crypto::sha256_hex;

/// Prefixes routed to the token-validation region; everything else goes to
/// the data region.
const TOKEN_REGION_PREFIXES: &[&str] = &["jwt", "apikey"];

/// Longest key stored verbatim; anything longer (or non-printable) is hashed.
const MAX_LITERAL_KEY_LEN: usize = 64;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

fn monotonic_millis() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
    last_access: AtomicU64,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }

    fn touch(&self) {
        self.last_access.store(monotonic_millis(), Ordering::Relaxed);
    }
}

struct CacheRegion {
    entries: DashMap<String, CacheEntry>,
    capacity: usize,
}

impl CacheRegion {
    fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&self, key: String, value: String, ttl: Duration) {
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
                last_access: AtomicU64::new(monotonic_millis()),
            },
        );
    }

    /// Drop expired entries, then the least-recently-used tenth of the
    /// region if still at capacity.
    fn evict_oldest(&self) {
        let mut expired = Vec::new();
        let mut by_access: Vec<(String, u64)> = Vec::with_capacity(self.entries.len());

        for entry in self.entries.iter() {
            if entry.value().is_expired() {
                expired.push(entry.key().clone());
            } else {
                by_access.push((
                    entry.key().clone(),
                    entry.value().last_access.load(Ordering::Relaxed),
                ));
            }
        }

        for key in &expired {
            self.entries.remove(key);
        }

        if self.entries.len() < self.capacity {
            return;
        }

        by_access.sort_by_key(|(_, access)| *access);
        let to_drop = (self.capacity / 10).max(1);
        for (key, _) in by_access.into_iter().take(to_drop) {
            self.entries.remove(&key);
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        entry.touch();
        Some(entry.value.clone())
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn remove_matching(&self, pattern: &str) -> usize {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        let removed = matching.len();
        for key in matching {
            self.entries.remove(&key);
        }
        removed
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub token_entries: usize,
    pub data_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

pub struct SecureCache {
    enabled: bool,
    token_region: CacheRegion,
    data_region: CacheRegion,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl SecureCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            token_region: CacheRegion::new(settings.token_capacity),
            data_region: CacheRegion::new(settings.data_capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn region(&self, prefix: &str) -> &CacheRegion {
        if TOKEN_REGION_PREFIXES.contains(&prefix) {
            &self.token_region
        } else {
            &self.data_region
        }
    }

    /// Derive the stored key: short printable keys pass through, long or
    /// complex keys are replaced by their SHA-256 digest.
    fn storage_key(prefix: &str, key: &str) -> String {
        let printable = key.len() <= MAX_LITERAL_KEY_LEN
            && key
                .chars()
                .all(|c| c.is_ascii_graphic());
        if printable {
            format!("{}:{}", prefix, key)
        } else {
            format!("{}:{}", prefix, sha256_hex(key))
        }
    }

    pub fn get<T: DeserializeOwned>(&self, prefix: &str, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }
        let storage_key = Self::storage_key(prefix, key);
        match self.region(prefix).get(&storage_key) {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(value)
                },
                Err(e) => {
                    debug!("Cache entry for {} failed to deserialize: {}", prefix, e);
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    self.region(prefix).remove(&storage_key);
                    None
                },
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    pub fn set<T: Serialize>(&self, prefix: &str, key: &str, value: &T, ttl: Duration) {
        if !self.enabled || ttl.is_zero() {
            return;
        }
        match serde_json::to_string(value) {
            Ok(raw) => {
                self.region(prefix)
                    .insert(Self::storage_key(prefix, key), raw, ttl);
            },
            Err(e) => {
                debug!("Cache serialize failed for {}: {}", prefix, e);
                self.errors.fetch_add(1, Ordering::Relaxed);
            },
        }
    }

    pub fn invalidate(&self, prefix: &str, key: &str) {
        let storage_key = Self::storage_key(prefix, key);
        self.region(prefix).remove(&storage_key);
    }

    /// Remove every entry (both regions) whose stored key matches the glob
    /// pattern, e.g. `permissions:*`.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.token_region.remove_matching(pattern) + self.data_region.remove_matching(pattern)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.enabled,
            token_entries: self.token_region.entries.len(),
            data_entries: self.data_region.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
