//! Local lookup cache for emergency profiles.
//!
//! Purely a convenience to make repeated local lookups fast. It is never
//! a source of truth across devices or sessions; only the ledger-anchored
//! cid is authoritative. Entries are keyed by the full normalized patient
//! address, never a prefix, so two patients sharing leading characters can
//! never collide.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::EmergencyProfile;
use crate::types::Address;

/// Configuration for the emergency lookup cache.
#[derive(Debug, Clone)]
pub struct EmergencyCacheConfig {
    /// How long a cached profile stays usable.
    pub ttl: Duration,
    /// Maximum number of cached profiles.
    pub max_entries: usize,
}

impl Default for EmergencyCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 1_000,
        }
    }
}

struct CachedProfile {
    profile: EmergencyProfile,
    created_at: Instant,
    expires_at: Instant,
}

impl CachedProfile {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default)]
pub struct EmergencyCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// In-memory, TTL-bounded profile cache.
pub struct EmergencyCache {
    entries: DashMap<String, CachedProfile>,
    config: EmergencyCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmergencyCache {
    pub fn new(config: EmergencyCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EmergencyCacheConfig::default())
    }

    /// Get a cached profile if present and unexpired.
    pub fn get(&self, patient: &Address) -> Option<EmergencyProfile> {
        if let Some(entry) = self.entries.get(patient.as_str()) {
            if !entry.is_expired() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.profile.clone());
            }
            drop(entry);
            self.entries.remove(patient.as_str());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Cache a profile under the full patient address.
    pub fn insert(&self, patient: &Address, profile: EmergencyProfile) {
        if self.entries.len() >= self.config.max_entries {
            self.evict_oldest();
        }
        let now = Instant::now();
        self.entries.insert(
            patient.as_str().to_string(),
            CachedProfile {
                profile,
                created_at: now,
                expires_at: now + self.config.ttl,
            },
        );
    }

    /// Drop a patient's cached profile (e.g. after republishing).
    pub fn invalidate(&self, patient: &Address) {
        self.entries.remove(patient.as_str());
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn cleanup(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> EmergencyCacheStats {
        EmergencyCacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.created_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl Default for EmergencyCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::profile::sample_profile;

    #[test]
    fn test_cache_hit_and_miss() {
        let cache = EmergencyCache::with_defaults();
        let patient = Address::new("0xp1");

        assert!(cache.get(&patient).is_none());
        cache.insert(&patient, sample_profile("0xp1"));
        assert!(cache.get(&patient).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_full_address_keying() {
        let cache = EmergencyCache::with_defaults();
        cache.insert(&Address::new("0xabc1"), sample_profile("0xabc1"));

        // A prefix-sharing address is a distinct key
        assert!(cache.get(&Address::new("0xabc")).is_none());
        assert!(cache.get(&Address::new("0xabc12")).is_none());
        assert_eq!(
            cache.get(&Address::new("0xABC1")).unwrap().patient,
            Address::new("0xabc1")
        );
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = EmergencyCache::new(EmergencyCacheConfig {
            ttl: Duration::from_millis(10),
            ..Default::default()
        });
        let patient = Address::new("0xp1");
        cache.insert(&patient, sample_profile("0xp1"));

        assert!(cache.get(&patient).is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&patient).is_none());
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = EmergencyCache::new(EmergencyCacheConfig {
            max_entries: 2,
            ..Default::default()
        });

        for i in 0..3 {
            let addr = Address::new(format!("0xp{i}"));
            cache.insert(&addr, sample_profile(addr.as_str()));
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&Address::new("0xp0")).is_none());
        assert!(cache.get(&Address::new("0xp2")).is_some());
    }

    #[test]
    fn test_invalidate_and_cleanup() {
        let cache = EmergencyCache::new(EmergencyCacheConfig {
            ttl: Duration::from_millis(10),
            ..Default::default()
        });
        cache.insert(&Address::new("0xp1"), sample_profile("0xp1"));
        cache.insert(&Address::new("0xp2"), sample_profile("0xp2"));

        cache.invalidate(&Address::new("0xp1"));
        assert_eq!(cache.len(), 1);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.cleanup(), 1);
        assert!(cache.is_empty());
    }
}
