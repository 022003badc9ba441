use std::{collections::HashMap, sync::Arc};

use arbflow_helpers::time::Clock;
use tracing::debug;

/// Configuration for the active trading pair tracker.
#[derive(Debug, Clone)]
pub struct ActivePairsConfig {
    /// The maximum number of pairs tracked before eviction kicks in.
    pub max_active_pairs: usize,
    /// How long a pair stays tracked without being seen again.
    pub pair_ttl_ms: u64,
}

impl Default for ActivePairsConfig {
    fn default() -> Self {
        ActivePairsConfig {
            max_active_pairs: 10_000,
            pair_ttl_ms: 3_600_000,
        }
    }
}

/// A tracked trading pair, keyed externally by pair address.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivePairEntry {
    pub last_seen: u64,
    pub chain: String,
    pub dex: String,
}

/// Tracks recently-seen trading pairs with a TTL and a bounded size.
///
/// Overflow evicts the oldest entries down to 75% of capacity rather
/// than exactly to capacity, so a tracker hovering at its limit does
/// not evict on every insert.
pub struct ActivePairsTracker {
    pairs: HashMap<String, ActivePairEntry>,
    config: ActivePairsConfig,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl ActivePairsTracker {
    pub fn new(config: ActivePairsConfig, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        ActivePairsTracker {
            pairs: HashMap::new(),
            config,
            clock,
        }
    }

    /// Records a sighting of a pair, refreshing its `last_seen` stamp.
    pub fn track_pair(&mut self, pair_address: &str, chain: &str, dex: &str) {
        let now = self.clock.now_ms();
        self.pairs.insert(
            pair_address.to_string(),
            ActivePairEntry {
                last_seen: now,
                chain: chain.to_string(),
                dex: dex.to_string(),
            },
        );

        if self.pairs.len() > self.config.max_active_pairs {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        let target = self.config.max_active_pairs * 3 / 4;
        let evict_count = self.pairs.len().saturating_sub(target);

        let mut by_age: Vec<(String, u64)> = self
            .pairs
            .iter()
            .map(|(address, entry)| (address.clone(), entry.last_seen))
            .collect();
        by_age.sort_by_key(|(_, last_seen)| *last_seen);

        for (address, _) in by_age.into_iter().take(evict_count) {
            self.pairs.remove(&address);
        }

        debug!(
            evicted = evict_count,
            remaining = self.pairs.len(),
            "evicted oldest active pairs"
        );
    }

    /// Removes entries that have not been seen within the pair TTL.
    /// Returns the number of entries removed.
    pub fn cleanup(&mut self) -> usize {
        let now = self.clock.now_ms();
        let ttl = self.config.pair_ttl_ms;
        let before = self.pairs.len();
        self.pairs
            .retain(|_, entry| now.saturating_sub(entry.last_seen) <= ttl);
        before - self.pairs.len()
    }

    pub fn has(&self, pair_address: &str) -> bool {
        self.pairs.contains_key(pair_address)
    }

    /// Returns a snapshot of the entry; callers may mutate the copy
    /// without affecting internal state.
    pub fn get(&self, pair_address: &str) -> Option<ActivePairEntry> {
        self.pairs.get(pair_address).cloned()
    }

    pub fn set(&mut self, pair_address: &str, entry: ActivePairEntry) {
        self.pairs.insert(pair_address.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbflow_helpers::time::ManualClock;
    use pretty_assertions::assert_eq;

    fn tracker(max: usize, ttl_ms: u64) -> (ActivePairsTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let tracker = ActivePairsTracker::new(
            ActivePairsConfig {
                max_active_pairs: max,
                pair_ttl_ms: ttl_ms,
            },
            clock.clone(),
        );
        (tracker, clock)
    }

    #[test]
    fn test_tracks_and_refreshes_pairs() {
        let (mut tracker, clock) = tracker(10, 60_000);

        tracker.track_pair("0xabc", "ethereum", "uniswap-v3");
        assert!(tracker.has("0xabc"));
        assert_eq!(tracker.get("0xabc").unwrap().last_seen, 1_000);

        clock.advance(500);
        tracker.track_pair("0xabc", "ethereum", "uniswap-v3");
        assert_eq!(tracker.get("0xabc").unwrap().last_seen, 1_500);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_overflow_evicts_down_to_threshold() {
        let (mut tracker, clock) = tracker(8, 60_000);

        for i in 0..8 {
            tracker.track_pair(&format!("0x{i}"), "ethereum", "uniswap-v3");
            clock.advance(10);
        }
        assert_eq!(tracker.len(), 8);

        // The ninth insert trips eviction down to 75% of capacity
        // (6 entries) plus the fresh insert itself surviving.
        tracker.track_pair("0xnew", "ethereum", "uniswap-v3");
        assert!(tracker.len() <= 8 * 3 / 4 + 1);
        assert!(tracker.has("0xnew"));

        // The oldest entries are the ones that went.
        assert!(!tracker.has("0x0"));
        assert!(!tracker.has("0x1"));
    }

    #[test]
    fn test_cleanup_drops_expired_entries() {
        let (mut tracker, clock) = tracker(10, 1_000);

        tracker.track_pair("0xold", "ethereum", "uniswap-v3");
        clock.advance(800);
        tracker.track_pair("0xfresh", "base", "aerodrome");

        clock.advance(300);
        let removed = tracker.cleanup();
        assert_eq!(removed, 1);
        assert!(!tracker.has("0xold"));
        assert!(tracker.has("0xfresh"));
    }

    #[test]
    fn test_map_compatible_accessors() {
        let (mut tracker, _clock) = tracker(10, 60_000);

        tracker.set(
            "0xabc",
            ActivePairEntry {
                last_seen: 42,
                chain: "base".to_string(),
                dex: "aerodrome".to_string(),
            },
        );
        assert_eq!(tracker.len(), 1);

        // Mutating the snapshot must not affect internal state.
        let mut snapshot = tracker.get("0xabc").unwrap();
        snapshot.chain = "ethereum".to_string();
        assert_eq!(tracker.get("0xabc").unwrap().chain, "base");

        tracker.clear();
        assert!(tracker.is_empty());
    }
}
