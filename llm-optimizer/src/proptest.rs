//! Property-based tests for the cache, batching and accounting invariants.
//!
//! These tests check that:
//!
//! - A value stored is immediately readable
//! - No tier ever holds more entries than its capacity
//! - Every key lives in at most one tier
//! - The derived hit rate always matches the raw counters
//! - Cost splits conserve the batch total

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashSet;

    use crate::batch::{batch_key, split_cost};
    use crate::cache::{CacheKey, SetOptions, Tier, TierCache};
    use crate::config::{CostSplit, OptimizerConfig};
    use crate::llm::{CompletionRequest, TokenUsage};
    use crate::metrics::MetricsAggregator;

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, f64),
        Get(u8),
        Delete(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u8..24, 0.0f64..0.05).prop_map(|(k, c)| Op::Set(k, c)),
            3 => (0u8..24).prop_map(Op::Get),
            1 => (0u8..24).prop_map(Op::Delete),
        ]
    }

    fn small_cache(l1: usize, l2: usize, l3: usize) -> TierCache {
        TierCache::new(&OptimizerConfig::default().with_tier_sizes(l1, l2, l3)).unwrap()
    }

    fn key(k: u8) -> CacheKey {
        CacheKey::new(format!("key-{}", k))
    }

    // =========================================================================
    // Cache Properties
    // =========================================================================

    proptest! {
        /// A set followed by a get returns the stored value.
        #[test]
        fn set_then_get_round_trips(k in "[a-z0-9]{1,16}", v in any::<i64>(), cost in 0.0f64..1.0) {
            let cache = small_cache(4, 8, 16);
            cache.set(CacheKey::new(k.clone()), json!({ "v": v }), SetOptions::new().with_cost(cost)).unwrap();
            prop_assert_eq!(cache.get(&CacheKey::new(k)), Some(json!({ "v": v })));
        }

        /// Tier sizes never exceed capacity, whatever the operation sequence.
        #[test]
        fn tiers_stay_within_capacity(
            l1 in 1usize..4,
            l2 in 1usize..6,
            l3 in 1usize..8,
            ops in prop::collection::vec(op(), 1..120)
        ) {
            let cache = small_cache(l1, l2, l3);
            for op in ops {
                match op {
                    Op::Set(k, c) => cache.set(key(k), json!(k), SetOptions::new().with_cost(c)).unwrap(),
                    Op::Get(k) => { cache.get(&key(k)); }
                    Op::Delete(k) => { cache.delete(&key(k)); }
                }
                let [n1, n2, n3] = cache.len_per_tier();
                prop_assert!(n1 <= l1, "L1 holds {} > {}", n1, l1);
                prop_assert!(n2 <= l2, "L2 holds {} > {}", n2, l2);
                prop_assert!(n3 <= l3, "L3 holds {} > {}", n3, l3);
            }
        }

        /// No key is ever visible in two tiers.
        #[test]
        fn keys_live_in_one_tier(ops in prop::collection::vec(op(), 1..120)) {
            let cache = small_cache(2, 3, 5);
            for op in ops {
                match op {
                    Op::Set(k, c) => cache.set(key(k), json!(k), SetOptions::new().with_cost(c)).unwrap(),
                    Op::Get(k) => { cache.get(&key(k)); }
                    Op::Delete(k) => { cache.delete(&key(k)); }
                }
            }
            let mut seen = HashSet::new();
            for tier in Tier::ALL {
                for k in cache.keys_in(tier) {
                    prop_assert!(seen.insert(k.clone()), "{} found in more than one tier", k);
                    prop_assert_eq!(cache.tier_of(&k), Some(tier));
                }
            }
            prop_assert_eq!(seen.len(), cache.len());
        }

        /// hit_rate == hits / (hits + misses) after every lookup.
        #[test]
        fn hit_rate_matches_counters(ops in prop::collection::vec(op(), 1..80)) {
            let cache = small_cache(3, 5, 8);
            let mut lookups = 0u64;
            for op in ops {
                match op {
                    Op::Set(k, c) => cache.set(key(k), json!(k), SetOptions::new().with_cost(c)).unwrap(),
                    Op::Get(k) => {
                        cache.get(&key(k));
                        lookups += 1;
                        let stats = cache.stats();
                        let expected = stats.hits as f64 / (stats.hits + stats.misses) as f64;
                        prop_assert!((stats.hit_rate() - expected).abs() < 1e-12);
                    }
                    Op::Delete(k) => { cache.delete(&key(k)); }
                }
            }
            let stats = cache.stats();
            prop_assert_eq!(stats.hits + stats.misses, lookups);
            prop_assert_eq!(stats.l1_hits + stats.l2_hits + stats.l3_hits, stats.hits);
        }

        /// Export then import into a same-sized cache reproduces every tier.
        #[test]
        fn snapshot_preserves_placement(ops in prop::collection::vec(op(), 1..60)) {
            let source = small_cache(2, 3, 5);
            for op in ops {
                match op {
                    Op::Set(k, c) => source.set(key(k), json!(k), SetOptions::new().with_cost(c)).unwrap(),
                    Op::Get(k) => { source.get(&key(k)); }
                    Op::Delete(k) => { source.delete(&key(k)); }
                }
            }
            let target = small_cache(2, 3, 5);
            target.import(source.export()).unwrap();
            for tier in Tier::ALL {
                let mut expected = source.keys_in(tier);
                let mut actual = target.keys_in(tier);
                expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                actual.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                prop_assert_eq!(actual, expected);
            }
        }
    }

    // =========================================================================
    // Batching and Accounting Properties
    // =========================================================================

    proptest! {
        /// Member shares always add back up to the batch total.
        #[test]
        fn cost_split_conserves_total(
            cost in 0.0f64..10.0,
            tokens in prop::collection::vec(1u64..5_000, 1..12),
            proportional in any::<bool>()
        ) {
            let split = if proportional { CostSplit::Proportional } else { CostSplit::Even };
            let shares = split_cost(&TokenUsage::new(1000, 200), cost, &tokens, split);
            prop_assert_eq!(shares.len(), tokens.len());
            let total: f64 = shares.iter().map(|s| s.cost).sum();
            prop_assert!((total - cost).abs() < 1e-9, "shares sum to {} not {}", total, cost);
        }

        /// Temperatures that round to the same integer share a batch key.
        #[test]
        fn batch_key_rounds_temperature(t in 0.0f64..2.0, delta in -0.2f64..0.2) {
            let other = t + delta;
            let a = CompletionRequest::new("m").with_temperature(t);
            let b = CompletionRequest::new("m").with_temperature(other);
            let same = t.round() == other.round();
            prop_assert_eq!(batch_key(&a, "p") == batch_key(&b, "p"), same);
        }

        /// Cost reduction stays a fraction whatever is recorded.
        #[test]
        fn cost_reduction_is_a_fraction(
            hits in prop::collection::vec(0.0f64..1.0, 0..20),
            direct in prop::collection::vec(0.0f64..1.0, 0..20),
            batched in prop::collection::vec((0.0f64..1.0, 0.0f64..1.0), 0..20)
        ) {
            let metrics = MetricsAggregator::new();
            let usage = TokenUsage::new(10, 10);
            for saved in &hits {
                metrics.record_cache_hit(*saved);
            }
            for cost in &direct {
                metrics.record_direct("p", &usage, *cost, 1);
            }
            for (estimate, share) in &batched {
                metrics.record_batched("p", &usage, *estimate, *share, 1);
            }
            let snapshot = metrics.snapshot(0);
            let reduction = snapshot.cost_reduction();
            prop_assert!((0.0..=1.0).contains(&reduction));
            prop_assert_eq!(
                snapshot.total_requests,
                (hits.len() + direct.len() + batched.len()) as u64
            );
        }
    }
}
