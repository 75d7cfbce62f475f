//! Three-tier response cache with cost-aware eviction.
//!
//! Lookups check L1, then L2, then L3. A hit in a colder tier promotes the
//! entry one tier up. Inserts always land in L1; when a tier overflows, the
//! lowest-scoring fraction of its entries is demoted one tier down, and only
//! L3 deletes outright. All state lives behind one lock so an entry is in
//! exactly one tier at every instant, and the tag and expiry indexes never
//! disagree with the tier maps.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, instrument, warn};

use super::entry::{ttl_span, AccessPattern, CacheEntry, CacheKey, CacheStats, Tier};
use crate::config::{EvictionWeights, OptimizerConfig};
use crate::error::{Error, Result};
use crate::events::{EventSink, NullSink, OptimizerEvent, OptimizerEventKind};

/// Options for [`TierCache::set`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// TTL in milliseconds; the cache default when unset
    pub ttl_ms: Option<u64>,
    /// Cost saved by each future hit (USD)
    pub cost: f64,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub value: Value,
    /// Tier the entry was found in (before promotion)
    pub tier: Tier,
    /// Cost saved by serving this hit
    pub cost: f64,
    pub hit_count: u64,
}

/// Work done by one maintenance tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub promoted: usize,
    pub warmed: usize,
}

#[derive(Debug, Clone)]
pub(super) struct TierSettings {
    pub(super) capacities: [usize; 3],
    pub(super) default_ttl: Duration,
    pub(super) weights: EvictionWeights,
    pub(super) eviction_fraction: f64,
    pub(super) promotion_threshold: f64,
    pub(super) batch_limit: usize,
    pub(super) predictive_warming: bool,
    pub(super) warming_horizon: Duration,
}

impl TierSettings {
    fn from_config(config: &OptimizerConfig) -> Result<Self> {
        Ok(Self {
            capacities: [config.l1_size, config.l2_size, config.l3_size],
            default_ttl: ttl_span("defaultTTL", config.default_ttl_ms)?,
            weights: config.eviction_weights,
            eviction_fraction: config.eviction_fraction,
            promotion_threshold: config.promotion_threshold,
            batch_limit: config.maintenance_batch_limit,
            predictive_warming: config.enable_predictive_warming,
            warming_horizon: ttl_span("maintenanceIntervalMs", config.maintenance_interval_ms)?,
        })
    }

    pub(super) fn capacity(&self, tier: Tier) -> usize {
        self.capacities[tier.index()]
    }
}

/// Mutable cache state. Every field is guarded by the same lock.
#[derive(Debug, Default)]
pub(super) struct TierState {
    pub(super) tiers: [HashMap<CacheKey, CacheEntry>; 3],
    pub(super) tag_index: HashMap<String, HashSet<CacheKey>>,
    pub(super) expiry_index: BTreeSet<(DateTime<Utc>, u64, CacheKey)>,
    pub(super) patterns: HashMap<CacheKey, AccessPattern>,
    pub(super) stats: CacheStats,
    pub(super) next_seq: u64,
    pub(super) scan_cursor: usize,
}

impl TierState {
    fn locate(&self, key: &CacheKey) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|t| self.tiers[t.index()].contains_key(key))
    }

    /// Insert an entry the caller knows is absent from every tier.
    pub(super) fn insert_into(&mut self, tier: Tier, entry: CacheEntry) {
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(entry.key.clone());
        }
        self.expiry_index
            .insert((entry.expires_at, entry.seq, entry.key.clone()));
        self.next_seq = self.next_seq.max(entry.seq + 1);
        self.tiers[tier.index()].insert(entry.key.clone(), entry);
    }

    fn remove_entry(&mut self, key: &CacheKey) -> Option<(Tier, CacheEntry)> {
        let tier = self.locate(key)?;
        let entry = self.tiers[tier.index()].remove(key)?;

        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        self.expiry_index
            .remove(&(entry.expires_at, entry.seq, entry.key.clone()));
        self.patterns.remove(key);

        Some((tier, entry))
    }

    fn move_entry(&mut self, key: &CacheKey, from: Tier, to: Tier) -> bool {
        match self.tiers[from.index()].remove(key) {
            Some(entry) => {
                self.tiers[to.index()].insert(key.clone(), entry);
                true
            }
            None => false,
        }
    }

    /// A value `decode` rejects is dropped and counted as a miss.
    fn lookup<T>(
        &mut self,
        key: &CacheKey,
        now: DateTime<Utc>,
        settings: &TierSettings,
        events: &mut Vec<OptimizerEvent>,
        decode: impl FnOnce(&Value) -> std::result::Result<T, String>,
    ) -> Option<(CacheHit, T)> {
        let Some(tier) = self.locate(key) else {
            self.stats.misses += 1;
            events.push(OptimizerEvent::cache_miss(key.as_str()));
            return None;
        };

        let expired = self.tiers[tier.index()]
            .get(key)
            .is_some_and(|e| e.is_expired(now));
        if expired {
            self.remove_entry(key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            events.push(OptimizerEvent::new(OptimizerEventKind::CacheExpire)
                .with_key(key.as_str())
                .with_tier(tier));
            events.push(OptimizerEvent::cache_miss(key.as_str()));
            return None;
        }

        let entry = self.tiers[tier.index()].get_mut(key)?;
        let decoded = match decode(&entry.value) {
            Ok(decoded) => decoded,
            Err(error) => {
                warn!(key = %key, error = %error, "Dropping undecodable cache entry");
                self.remove_entry(key);
                self.stats.misses += 1;
                events.push(OptimizerEvent::cache_miss(key.as_str()));
                return None;
            }
        };
        entry.record_hit(now);
        let hit = CacheHit {
            value: entry.value.clone(),
            tier,
            cost: entry.cost,
            hit_count: entry.hit_count,
        };

        self.stats.record_hit(tier);
        self.patterns
            .entry(key.clone())
            .or_insert_with(|| AccessPattern::new(key.clone()))
            .record(now);
        events.push(OptimizerEvent::cache_hit(key.as_str(), tier));

        if let Some(hotter) = tier.hotter() {
            self.promote(key, tier, hotter, events);
            self.enforce_capacity(hotter, now, settings, events);
        }

        Some((hit, decoded))
    }

    fn promote(&mut self, key: &CacheKey, from: Tier, to: Tier, events: &mut Vec<OptimizerEvent>) {
        if self.move_entry(key, from, to) {
            self.stats.promotions += 1;
            events.push(OptimizerEvent::cache_move(
                OptimizerEventKind::CachePromote,
                key.as_str(),
                from,
                to,
            ));
        }
    }

    /// Demote (or, for L3, delete) the lowest-scoring entries of an
    /// overflowing tier, cascading into colder tiers as they overflow.
    fn enforce_capacity(
        &mut self,
        tier: Tier,
        now: DateTime<Utc>,
        settings: &TierSettings,
        events: &mut Vec<OptimizerEvent>,
    ) {
        let capacity = settings.capacity(tier);
        let len = self.tiers[tier.index()].len();
        if len <= capacity {
            return;
        }

        let fraction = (len as f64 * settings.eviction_fraction).ceil() as usize;
        let count = (len - capacity).max(fraction).min(len);

        let mut scored: Vec<(f64, u64, CacheKey)> = self.tiers[tier.index()]
            .values()
            .map(|e| (e.eviction_score(now, &settings.weights), e.seq, e.key.clone()))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        debug!(tier = %tier, len, capacity, count, "Eviction pass");

        for (_, _, key) in scored.into_iter().take(count) {
            match tier.colder() {
                Some(colder) => {
                    if self.move_entry(&key, tier, colder) {
                        self.stats.demotions += 1;
                        events.push(OptimizerEvent::cache_move(
                            OptimizerEventKind::CacheDemote,
                            key.as_str(),
                            tier,
                            colder,
                        ));
                    }
                }
                None => {
                    if self.remove_entry(&key).is_some() {
                        self.stats.evictions += 1;
                        events.push(OptimizerEvent::new(OptimizerEventKind::CacheEvict)
                            .with_key(key.as_str())
                            .with_tier(tier));
                    }
                }
            }
        }

        if let Some(colder) = tier.colder() {
            self.enforce_capacity(colder, now, settings, events);
        }
    }

    /// Keys of `tier` visited by this tick: at most `limit`, starting from a
    /// rotating offset so successive ticks cover the whole tier.
    fn scan_window(&mut self, tier: Tier, limit: usize) -> Vec<CacheKey> {
        let map = &self.tiers[tier.index()];
        if map.is_empty() {
            return Vec::new();
        }
        let start = self.scan_cursor % map.len();
        let keys: Vec<CacheKey> = map
            .keys()
            .skip(start)
            .chain(map.keys().take(start))
            .take(limit)
            .cloned()
            .collect();
        self.scan_cursor = self.scan_cursor.wrapping_add(keys.len());
        keys
    }

    fn sweep_expired(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
        events: &mut Vec<OptimizerEvent>,
    ) -> usize {
        let due: Vec<CacheKey> = self
            .expiry_index
            .iter()
            .take_while(|(expires_at, _, _)| *expires_at <= now)
            .take(limit)
            .map(|(_, _, key)| key.clone())
            .collect();

        for key in &due {
            if let Some((tier, _)) = self.remove_entry(key) {
                self.stats.expirations += 1;
                events.push(OptimizerEvent::new(OptimizerEventKind::CacheExpire)
                    .with_key(key.as_str())
                    .with_tier(tier));
            }
        }
        due.len()
    }

    fn rebalance(
        &mut self,
        now: DateTime<Utc>,
        settings: &TierSettings,
        events: &mut Vec<OptimizerEvent>,
    ) -> usize {
        let mut promoted = 0;
        for tier in [Tier::L2, Tier::L3] {
            let Some(hotter) = tier.hotter() else { continue };
            let budget = settings.batch_limit.saturating_sub(promoted);
            let candidates: Vec<CacheKey> = self
                .scan_window(tier, budget)
                .into_iter()
                .filter(|key| {
                    self.tiers[tier.index()].get(key).is_some_and(|e| {
                        !e.is_expired(now)
                            && e.hit_rate_per_sec(now) > settings.promotion_threshold
                    })
                })
                .collect();

            for key in candidates {
                self.promote(&key, tier, hotter, events);
                promoted += 1;
            }
        }

        if promoted > 0 {
            self.enforce_capacity(Tier::L1, now, settings, events);
            self.enforce_capacity(Tier::L2, now, settings, events);
        }
        promoted
    }

    fn predictive_warm(
        &mut self,
        now: DateTime<Utc>,
        settings: &TierSettings,
        events: &mut Vec<OptimizerEvent>,
    ) -> usize {
        let horizon = settings.warming_horizon;
        let until = now
            .checked_add_signed(horizon)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let since = now
            .checked_sub_signed(horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let due: Vec<CacheKey> = self
            .patterns
            .values()
            .filter_map(|p| {
                let next = p.predicted_next_access()?;
                (since..=until).contains(&next).then(|| p.key.clone())
            })
            .filter(|key| self.locate(key).is_some_and(|tier| tier != Tier::L1))
            .take(settings.batch_limit)
            .collect();

        let mut warmed = 0;
        for key in due {
            let Some(tier) = self.locate(&key) else { continue };
            let Some(hotter) = tier.hotter() else { continue };
            let fresh = self.tiers[tier.index()]
                .get(&key)
                .is_some_and(|e| !e.is_expired(now));
            if fresh {
                self.promote(&key, tier, hotter, events);
                warmed += 1;
            }
        }

        if warmed > 0 {
            self.enforce_capacity(Tier::L1, now, settings, events);
            self.enforce_capacity(Tier::L2, now, settings, events);
        }
        warmed
    }

    pub(super) fn stats_snapshot(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.l1_entries = self.tiers[0].len();
        stats.l2_entries = self.tiers[1].len();
        stats.l3_entries = self.tiers[2].len();
        stats.estimated_bytes = self
            .tiers
            .iter()
            .flat_map(|t| t.values())
            .map(|e| e.size)
            .sum();
        stats
    }
}

/// Three-tier response cache.
pub struct TierCache {
    pub(super) settings: TierSettings,
    pub(super) state: Mutex<TierState>,
    sink: Arc<dyn EventSink>,
}

impl TierCache {
    /// Create a cache sized from `config`.
    pub fn new(config: &OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            settings: TierSettings::from_config(config)?,
            state: Mutex::new(TierState::default()),
            sink: Arc::new(NullSink),
        })
    }

    /// Route cache events to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub(super) fn state(&self) -> MutexGuard<'_, TierState> {
        // Every mutation completes before any point that could panic, so a
        // poisoned lock still guards consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn emit_all(&self, events: Vec<OptimizerEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }

    /// Look up `key`, returning its value on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.lookup(key).map(|hit| hit.value)
    }

    /// Look up `key`, returning the hit with its tier and saved cost.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheHit> {
        let now = Utc::now();
        let mut events = Vec::new();
        let hit = self
            .state()
            .lookup(key, now, &self.settings, &mut events, |_| Ok(()));
        self.emit_all(events);
        hit.map(|(hit, ())| hit)
    }

    /// Look up `key` and deserialize its value in the same step. An entry
    /// that does not decode as `T` is removed and counts as a miss, never
    /// as a hit.
    pub fn lookup_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<(CacheHit, T)> {
        let now = Utc::now();
        let mut events = Vec::new();
        let hit = self.state().lookup(key, now, &self.settings, &mut events, |value| {
            T::deserialize(value).map_err(|e| e.to_string())
        });
        self.emit_all(events);
        hit
    }

    /// Insert `value` into L1, replacing any existing entry for `key`.
    pub fn set(&self, key: CacheKey, value: Value, options: SetOptions) -> Result<()> {
        if !options.cost.is_finite() || options.cost < 0.0 {
            return Err(Error::validation("cost", "must be a finite, non-negative number"));
        }
        let ttl = match options.ttl_ms {
            Some(ms) => ttl_span("ttl", ms)?,
            None => self.settings.default_ttl,
        };

        let now = Utc::now();
        let mut events = Vec::new();
        {
            let mut state = self.state();
            state.remove_entry(&key);

            let mut entry = CacheEntry::new(key, value, ttl, options.cost);
            entry.tags = options.tags.into_iter().collect();
            entry.metadata = options.metadata;
            entry.seq = state.next_seq;

            state.insert_into(Tier::L1, entry);
            state.stats.sets += 1;
            state.enforce_capacity(Tier::L1, now, &self.settings, &mut events);
        }
        self.emit_all(events);
        Ok(())
    }

    /// Bulk pre-population. Returns the number of entries stored.
    pub fn warm(
        &self,
        entries: impl IntoIterator<Item = (CacheKey, Value, SetOptions)>,
    ) -> Result<usize> {
        let mut stored = 0;
        for (key, value, options) in entries {
            self.set(key, value, options)?;
            stored += 1;
        }
        Ok(stored)
    }

    /// Remove `key` from whichever tier holds it.
    pub fn delete(&self, key: &CacheKey) -> bool {
        self.state().remove_entry(key).is_some()
    }

    /// Remove every entry indexed under `tag`. Returns how many were removed.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut events = Vec::new();
        let removed = {
            let mut state = self.state();
            let keys: Vec<CacheKey> = state
                .tag_index
                .get(tag)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default();

            let mut removed = 0;
            for key in keys {
                if let Some((tier, _)) = state.remove_entry(&key) {
                    removed += 1;
                    events.push(OptimizerEvent::new(OptimizerEventKind::CacheInvalidate)
                        .with_key(key.as_str())
                        .with_tier(tier)
                        .with_message(tag));
                }
            }
            state.stats.invalidations += removed as u64;
            removed
        };
        debug!(tag, removed, "Invalidated by tag");
        self.emit_all(events);
        removed
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut state = self.state();
        let stats = std::mem::take(&mut state.stats);
        *state = TierState {
            stats,
            ..TierState::default()
        };
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.tier_of(key).is_some()
    }

    /// Tier currently holding `key`, without counting an access.
    pub fn tier_of(&self, key: &CacheKey) -> Option<Tier> {
        self.state().locate(key)
    }

    /// Copy of the entry for `key`, without counting an access.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        let state = self.state();
        let tier = state.locate(key)?;
        state.tiers[tier.index()].get(key).cloned()
    }

    pub fn keys_in(&self, tier: Tier) -> Vec<CacheKey> {
        self.state().tiers[tier.index()].keys().cloned().collect()
    }

    /// Entry counts for L1, L2, L3.
    pub fn len_per_tier(&self) -> [usize; 3] {
        let state = self.state();
        [state.tiers[0].len(), state.tiers[1].len(), state.tiers[2].len()]
    }

    pub fn len(&self) -> usize {
        self.len_per_tier().iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self, tier: Tier) -> usize {
        self.settings.capacity(tier)
    }

    /// Statistics snapshot. Reading never changes counters.
    pub fn stats(&self) -> CacheStats {
        self.state().stats_snapshot()
    }

    /// Remove up to `limit` expired entries across all tiers.
    pub fn sweep_expired(&self, limit: usize) -> usize {
        let mut events = Vec::new();
        let removed = self.state().sweep_expired(Utc::now(), limit, &mut events);
        self.emit_all(events);
        removed
    }

    /// Promote entries whose hit rate exceeds the promotion threshold.
    pub fn rebalance(&self) -> usize {
        let mut events = Vec::new();
        let promoted = self.state().rebalance(Utc::now(), &self.settings, &mut events);
        self.emit_all(events);
        promoted
    }

    /// Promote entries predicted to be read within the next maintenance interval.
    pub fn predictive_warm(&self) -> usize {
        let mut events = Vec::new();
        let warmed = self
            .state()
            .predictive_warm(Utc::now(), &self.settings, &mut events);
        self.emit_all(events);
        warmed
    }

    /// One bounded maintenance tick: sweep, rebalance and, if enabled, warm.
    #[instrument(skip(self))]
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            expired: self.sweep_expired(self.settings.batch_limit),
            promoted: self.rebalance(),
            warmed: if self.settings.predictive_warming {
                self.predictive_warm()
            } else {
                0
            },
        };
        debug!(
            expired = report.expired,
            promoted = report.promoted,
            warmed = report.warmed,
            "Cache maintenance tick"
        );
        report
    }
}
