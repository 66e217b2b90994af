//! Two-tier read-through cache with provenance and state-dependent TTLs.
//!
//! The fast tier is an in-process map; the durable tier survives reloads.
//! Reads check the fast tier first and promote valid durable hits into it.
//! Entries expire lazily on read. Frequently read entries are kept for a
//! bounded grace window past expiry so a stale value can still be shown while
//! a refetch is in flight; the periodic sweep drops everything else.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::models::{CacheEntry, LifecycleState, Provenance};
use crate::store::DurableStore;

/// Composite cache keys shared by every component.
pub mod keys {
    use crate::models::{LeaderboardFilters, MatchId, SizeClass};

    pub fn match_info(id: MatchId) -> String {
        format!("match_info_{}", id)
    }

    pub fn match_results(id: MatchId) -> String {
        format!("match_results_{}", id)
    }

    pub fn recorded_rewards(id: MatchId) -> String {
        format!("recorded_rewards_{}", id)
    }

    pub fn completed_index() -> String {
        "completed_matches".to_string()
    }

    pub fn active_matches(size: SizeClass) -> String {
        format!("active_matches_{}", size)
    }

    pub fn wallet_status(address: &str) -> String {
        format!("wallet_status_{}", address)
    }

    pub fn player_inventory(address: &str) -> String {
        format!("player_inventory_{}", address)
    }

    pub fn leaderboard(filters: &LeaderboardFilters) -> String {
        format!(
            "leaderboard_{}_{}_{}",
            filters.window.as_str(),
            filters.sort.as_str(),
            filters.min_matches
        )
    }
}

/// TTLs per kind of cached data.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub live: Duration,
    pub completed: Duration,
    pub leaderboard: Duration,
    pub grace: Duration,
    pub hot_hits: u32,
}

impl TtlPolicy {
    pub fn for_state(&self, state: LifecycleState) -> Duration {
        match state {
            LifecycleState::Completed => self.completed,
            LifecycleState::Waiting | LifecycleState::Active | LifecycleState::Settling => {
                self.live
            }
        }
    }
}

impl From<&CacheConfig> for TtlPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            live: Duration::seconds(config.live_ttl_secs as i64),
            completed: Duration::seconds(config.completed_ttl_secs as i64),
            leaderboard: Duration::seconds(config.leaderboard_ttl_secs as i64),
            grace: Duration::seconds(config.grace_secs as i64),
            hot_hits: config.hot_hits,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        TtlPolicy::from(&CacheConfig::default())
    }
}

/// Durable-tier record layout.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    timestamp: DateTime<Utc>,
    provenance: Provenance,
    ttl_ms: i64,
    payload: serde_json::Value,
}

#[derive(Debug, Clone)]
struct FastEntry {
    entry: CacheEntry<serde_json::Value>,
    hits: u32,
}

impl FastEntry {
    fn is_hot(&self, hot_hits: u32) -> bool {
        self.hits >= hot_hits
    }

    fn within_grace(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now <= self.entry.expires_at() + grace
    }
}

pub struct ResultCache {
    fast: Mutex<HashMap<String, FastEntry>>,
    durable: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    policy: TtlPolicy,
}

impl ResultCache {
    pub fn new(durable: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, policy: TtlPolicy) -> Self {
        Self {
            fast: Mutex::new(HashMap::new()),
            durable,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn fast_tier(&self) -> std::sync::MutexGuard<'_, HashMap<String, FastEntry>> {
        self.fast.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a live entry, fast tier first, then durable with promotion.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = self.clock.now();

        if let Some(entry) = self.get_fast(key, now) {
            return Self::decode(key, entry);
        }

        let raw = match self.durable.load(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = key, error = %e, "Durable cache read failed");
                return None;
            }
        };

        let record: StoredRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = key, error = %e, "Discarding undecodable durable cache record");
                self.remove_durable(key).await;
                return None;
            }
        };

        let entry = CacheEntry::new(
            record.payload,
            record.provenance,
            Duration::milliseconds(record.ttl_ms),
            record.timestamp,
        );
        if entry.is_expired(now) {
            debug!(key = key, "Durable cache entry expired");
            self.remove_durable(key).await;
            return None;
        }

        debug!(key = key, "Promoting durable cache entry");
        self.fast_tier()
            .insert(key.to_string(), FastEntry { entry: entry.clone(), hits: 1 });
        Self::decode(key, entry)
    }

    fn get_fast(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry<serde_json::Value>> {
        let mut fast = self.fast_tier();
        let slot = fast.get_mut(key)?;

        if slot.entry.is_expired(now) {
            let keep = slot.is_hot(self.policy.hot_hits) && slot.within_grace(now, self.policy.grace);
            if !keep {
                fast.remove(key);
            }
            debug!(key = key, retained = keep, "Cache entry expired");
            return None;
        }

        slot.hits = slot.hits.saturating_add(1);
        debug!(key = key, hits = slot.hits, "Cache hit");
        Some(slot.entry.clone())
    }

    fn decode<T: DeserializeOwned>(key: &str, entry: CacheEntry<serde_json::Value>) -> Option<CacheEntry<T>> {
        let CacheEntry {
            value,
            written_at,
            provenance,
            ttl,
        } = entry;
        match serde_json::from_value(value) {
            Ok(value) => Some(CacheEntry::new(value, provenance, ttl, written_at)),
            Err(e) => {
                warn!(key = key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Write both tiers. Durable failures are logged and do not fail the write.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, provenance: Provenance, ttl: Duration) {
        let payload = match serde_json::to_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = key, error = %e, "Value could not be serialized for caching");
                return;
            }
        };
        let now = self.clock.now();
        let entry = CacheEntry::new(payload.clone(), provenance, ttl, now);

        {
            let mut fast = self.fast_tier();
            let hits = fast.get(key).map(|slot| slot.hits).unwrap_or(0);
            fast.insert(key.to_string(), FastEntry { entry, hits });
        }

        let record = StoredRecord {
            timestamp: now,
            provenance,
            ttl_ms: ttl.num_milliseconds(),
            payload,
        };
        let retention = (ttl + self.policy.grace).to_std().unwrap_or_default();
        let result = match serde_json::to_string(&record) {
            Ok(json) => self.durable.save(key, json, retention).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(key = key, error = %e, "Durable cache write failed");
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.fast_tier().remove(key);
        self.remove_durable(key).await;
        debug!(key = key, "Cache entry invalidated");
    }

    async fn remove_durable(&self, key: &str) {
        if let Err(e) = self.durable.remove(key).await {
            warn!(key = key, error = %e, "Durable cache delete failed");
        }
    }

    /// Drop everything, e.g. on logout or wallet switch.
    pub async fn clear(&self) {
        self.fast_tier().clear();
        if let Err(e) = self.durable.clear().await {
            warn!(error = %e, "Durable cache clear failed");
        }
    }

    /// Last known value even if expired, as long as it is still retained.
    pub fn peek_stale<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.fast_tier().get(key).map(|slot| slot.entry.clone())?;
        Self::decode(key, entry)
    }

    /// Remove expired entries unless they are hot and still inside the grace window.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let hot_hits = self.policy.hot_hits;
        let grace = self.policy.grace;

        let mut fast = self.fast_tier();
        let before = fast.len();
        fast.retain(|_, slot| {
            !slot.entry.is_expired(now) || (slot.is_hot(hot_hits) && slot.within_grace(now, grace))
        });
        let removed = before - fast.len();
        if removed > 0 {
            debug!(removed = removed, remaining = fast.len(), "Cache sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.fast_tier().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
