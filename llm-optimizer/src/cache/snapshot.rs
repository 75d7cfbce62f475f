//! Best-effort cache export and all-or-nothing import.
//!
//! Import builds a complete replacement state off to the side and swaps it
//! in under the cache lock only after every check has passed. A rejected
//! snapshot leaves the live cache untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use super::entry::{AccessPattern, CacheEntry, CacheKey, CacheStats, Tier};
use super::tier::{TierCache, TierSettings, TierState};
use crate::error::{Error, Result};

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable copy of the whole cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub l1: Vec<CacheEntry>,
    pub l2: Vec<CacheEntry>,
    pub l3: Vec<CacheEntry>,
    pub stats: CacheStats,
    #[serde(default)]
    pub access_patterns: Vec<AccessPattern>,
}

impl CacheSnapshot {
    fn tier(&self, tier: Tier) -> &[CacheEntry] {
        match tier {
            Tier::L1 => &self.l1,
            Tier::L2 => &self.l2,
            Tier::L3 => &self.l3,
        }
    }
}

/// Outcome of a successful import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub imported: usize,
    /// Entries already past their expiry, dropped rather than loaded
    pub skipped_expired: usize,
}

impl TierState {
    fn from_snapshot(
        snapshot: CacheSnapshot,
        settings: &TierSettings,
        now: DateTime<Utc>,
    ) -> Result<(Self, ImportSummary)> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::cache_import(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        let mut seen: HashSet<&CacheKey> = HashSet::new();
        let mut summary = ImportSummary::default();

        for tier in Tier::ALL {
            let mut live = 0;
            for entry in snapshot.tier(tier) {
                if !seen.insert(&entry.key) {
                    return Err(Error::cache_import(format!(
                        "key {} appears more than once",
                        entry.key
                    )));
                }
                if entry.expires_at < entry.created_at {
                    return Err(Error::cache_import(format!(
                        "key {} expires before it was created",
                        entry.key
                    )));
                }
                if !entry.cost.is_finite() || entry.cost < 0.0 {
                    return Err(Error::cache_import(format!(
                        "key {} has invalid cost {}",
                        entry.key, entry.cost
                    )));
                }
                if !entry.is_expired(now) {
                    live += 1;
                }
            }
            if live > settings.capacity(tier) {
                return Err(Error::cache_import(format!(
                    "{} holds {} live entries, capacity is {}",
                    tier,
                    live,
                    settings.capacity(tier)
                )));
            }
        }

        let CacheSnapshot {
            l1,
            l2,
            l3,
            stats,
            access_patterns,
            ..
        } = snapshot;

        let mut state = TierState {
            stats,
            ..TierState::default()
        };
        for (tier, entries) in [(Tier::L1, l1), (Tier::L2, l2), (Tier::L3, l3)] {
            for entry in entries {
                if entry.is_expired(now) {
                    summary.skipped_expired += 1;
                } else {
                    state.insert_into(tier, entry);
                    summary.imported += 1;
                }
            }
        }
        for pattern in access_patterns {
            if Tier::ALL
                .iter()
                .any(|t| state.tiers[t.index()].contains_key(&pattern.key))
            {
                state.patterns.insert(pattern.key.clone(), pattern);
            }
        }

        Ok((state, summary))
    }
}

impl TierCache {
    /// Serializable copy of every tier, the counters and access history.
    pub fn export(&self) -> CacheSnapshot {
        let state = self.state();
        let sorted = |tier: Tier| {
            let mut entries: Vec<CacheEntry> =
                state.tiers[tier.index()].values().cloned().collect();
            entries.sort_by_key(|e| e.seq);
            entries
        };

        CacheSnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            l1: sorted(Tier::L1),
            l2: sorted(Tier::L2),
            l3: sorted(Tier::L3),
            stats: state.stats_snapshot(),
            access_patterns: state.patterns.values().cloned().collect(),
        }
    }

    /// Replace the cache contents with `snapshot`, or change nothing.
    pub fn import(&self, snapshot: CacheSnapshot) -> Result<ImportSummary> {
        let (replacement, summary) =
            match TierState::from_snapshot(snapshot, &self.settings, Utc::now()) {
                Ok(built) => built,
                Err(e) => {
                    warn!(error = %e, "Rejected cache snapshot");
                    return Err(e);
                }
            };

        *self.state() = replacement;
        info!(
            imported = summary.imported,
            skipped_expired = summary.skipped_expired,
            "Imported cache snapshot"
        );
        Ok(summary)
    }

    /// Import from a JSON document.
    pub fn import_json(&self, json: &str) -> Result<ImportSummary> {
        let snapshot: CacheSnapshot =
            serde_json::from_str(json).map_err(|e| Error::cache_import(e.to_string()))?;
        self.import(snapshot)
    }

    /// Write a JSON snapshot to `path`.
    pub fn export_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string(&self.export())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a JSON snapshot from `path`.
    pub fn import_from_file(&self, path: impl AsRef<Path>) -> Result<ImportSummary> {
        let json = std::fs::read_to_string(path)?;
        self.import_json(&json)
    }
}
