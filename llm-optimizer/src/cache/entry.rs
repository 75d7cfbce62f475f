//! Cache keys, entries, tiers and access history.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::OnceLock;

use crate::config::EvictionWeights;
use crate::error::{Error, Result};
use crate::llm::CompletionRequest;

/// Number of access timestamps remembered per key.
pub const ACCESS_HISTORY_LEN: usize = 16;

/// Convert a millisecond TTL into a span that can be added to the clock.
///
/// Zero is rejected, and so is anything that would push an expiry past
/// the largest representable timestamp.
pub fn ttl_span(field: &str, ttl_ms: u64) -> Result<Duration> {
    if ttl_ms == 0 {
        return Err(Error::validation(field, "must be greater than zero"));
    }
    let span = i64::try_from(ttl_ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .filter(|span| Utc::now().checked_add_signed(*span).is_some())
        .ok_or_else(|| Error::validation(field, format!("{} ms is out of range", ttl_ms)))?;
    Ok(span)
}

/// Request fingerprint used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    /// Fingerprint a request from its model, normalized content and
    /// sampling parameters. Whitespace differences do not change the key.
    pub fn fingerprint(request: &CompletionRequest) -> Self {
        let mut hasher = Sha256::new();

        hasher.update(b"model:");
        hasher.update(request.model.as_bytes());
        hasher.update(b"\n");

        if let Some(system) = &request.system {
            hasher.update(b"system:");
            hasher.update(normalize(system).as_bytes());
            hasher.update(b"\n");
        }

        for msg in &request.messages {
            hasher.update(format!("{}:", msg.role).as_bytes());
            hasher.update(normalize(&msg.content).as_bytes());
            hasher.update(b"\n");
        }

        if let Some(t) = request.temperature {
            hasher.update(format!("temperature:{:.2}\n", t).as_bytes());
        }
        if let Some(max) = request.max_tokens {
            hasher.update(format!("max_tokens:{}\n", max).as_bytes());
        }

        CacheKey(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for hashes, verbatim for human-chosen keys
        let end = self
            .0
            .char_indices()
            .nth(16)
            .map_or(self.0.len(), |(i, _)| i);
        write!(f, "{}", &self.0[..end])
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        CacheKey(key.to_string())
    }
}

fn normalize(text: &str) -> String {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    let ws = WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("static regex"));
    ws.replace_all(text.trim(), " ").into_owned()
}

/// Cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Hot
    L1,
    /// Warm
    L2,
    /// Cold
    L3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::L1, Tier::L2, Tier::L3];

    pub fn index(self) -> usize {
        match self {
            Tier::L1 => 0,
            Tier::L2 => 1,
            Tier::L3 => 2,
        }
    }

    /// Tier an evicted entry is demoted into; `None` for L3.
    pub fn colder(self) -> Option<Tier> {
        match self {
            Tier::L1 => Some(Tier::L2),
            Tier::L2 => Some(Tier::L3),
            Tier::L3 => None,
        }
    }

    /// Tier a hit entry is promoted into; `None` for L1.
    pub fn hotter(self) -> Option<Tier> {
        match self {
            Tier::L1 => None,
            Tier::L2 => Some(Tier::L1),
            Tier::L3 => Some(Tier::L2),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::L1 => write!(f, "L1"),
            Tier::L2 => write!(f, "L2"),
            Tier::L3 => write!(f, "L3"),
        }
    }
}

/// A cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Value,
    /// Estimated encoded size in bytes
    pub size: usize,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// Fixed at insertion; reads never extend it
    pub expires_at: DateTime<Utc>,
    /// Cost this entry saves on every hit (USD)
    pub cost: f64,
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Insertion order, breaks eviction-score ties oldest first
    #[serde(default)]
    pub seq: u64,
}

impl CacheEntry {
    pub fn new(key: CacheKey, value: Value, ttl: Duration, cost: f64) -> Self {
        let now = Utc::now();
        let size = value.to_string().len();
        Self {
            key,
            value,
            size,
            hit_count: 0,
            created_at: now,
            last_access: now,
            // Saturates; a TTL checked earlier can still overflow as the clock moves
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            cost,
            tags: BTreeSet::new(),
            metadata: HashMap::new(),
            seq: 0,
        }
    }

    /// Record a cache hit.
    pub fn record_hit(&mut self, now: DateTime<Utc>) {
        self.hit_count += 1;
        self.last_access = now;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Cost-aware eviction score; lower scores are evicted first.
    pub fn eviction_score(&self, now: DateTime<Utc>, weights: &EvictionWeights) -> f64 {
        let idle_ms = (now - self.last_access).num_milliseconds().max(0) as f64;
        let age_ms = (now - self.created_at).num_milliseconds().max(0) as f64;

        self.cost * weights.cost + self.hit_count as f64 * weights.frequency
            - idle_ms / 1000.0 * weights.recency
            - age_ms / 10_000.0
    }

    /// Hits per second of age, floored at one second of age.
    pub fn hit_rate_per_sec(&self, now: DateTime<Utc>) -> f64 {
        let age_secs = (now - self.created_at).num_milliseconds().max(1000) as f64 / 1000.0;
        self.hit_count as f64 / age_secs
    }
}

/// Recent access timestamps for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPattern {
    pub key: CacheKey,
    pub accesses: VecDeque<DateTime<Utc>>,
}

impl AccessPattern {
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            accesses: VecDeque::with_capacity(ACCESS_HISTORY_LEN),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        if self.accesses.len() == ACCESS_HISTORY_LEN {
            self.accesses.pop_front();
        }
        self.accesses.push_back(at);
    }

    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        self.accesses.back().copied()
    }

    /// Last access plus the mean inter-access interval. Needs two accesses.
    pub fn predicted_next_access(&self) -> Option<DateTime<Utc>> {
        let first = *self.accesses.front()?;
        let last = *self.accesses.back()?;
        let intervals = self.accesses.len().checked_sub(1).filter(|n| *n > 0)?;
        let mean_ms = (last - first).num_milliseconds() / intervals as i64;
        last.checked_add_signed(Duration::milliseconds(mean_ms))
    }
}

/// Cache statistics snapshot. Rates are derived, never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub sets: u64,
    /// Entries deleted from L3 for capacity
    pub evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub l1_entries: usize,
    pub l2_entries: usize,
    pub l3_entries: usize,
    /// Sum of estimated entry sizes; not enforced
    pub estimated_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn total_entries(&self) -> usize {
        self.l1_entries + self.l2_entries + self.l3_entries
    }

    pub(crate) fn record_hit(&mut self, tier: Tier) {
        self.hits += 1;
        match tier {
            Tier::L1 => self.l1_hits += 1,
            Tier::L2 => self.l2_hits += 1,
            Tier::L3 => self.l3_hits += 1,
        }
    }
}
