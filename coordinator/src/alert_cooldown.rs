use std::collections::HashMap;

use tracing::debug;

/// Configuration for alert cooldown deduplication.
#[derive(Debug, Clone)]
pub struct AlertCooldownConfig {
    /// The minimum interval between two deliveries of the same
    /// alert key.
    pub cooldown_ms: u64,
    /// Entries older than this are dropped on cleanup.
    pub max_age_ms: u64,
    /// Cleanup runs automatically once the map grows past this size.
    pub cleanup_threshold: usize,
}

impl Default for AlertCooldownConfig {
    fn default() -> Self {
        AlertCooldownConfig {
            cooldown_ms: 300_000,
            max_age_ms: 3_600_000,
            cleanup_threshold: 1_000,
        }
    }
}

/// Owns every alert suppression decision in the pipeline.
///
/// Other components nominate alerts; only this manager decides
/// whether one actually goes out, so a single alert can never be
/// double-suppressed or double-sent by two layers disagreeing.
pub struct AlertCooldownManager {
    last_sent: HashMap<String, u64>,
    config: AlertCooldownConfig,
}

impl AlertCooldownManager {
    pub fn new(config: AlertCooldownConfig) -> Self {
        AlertCooldownManager {
            last_sent: HashMap::new(),
            config,
        }
    }

    /// Returns true when the alert key is outside its cooldown window,
    /// recording the send time in the same step so that a concurrent
    /// nomination of the same key cannot also pass.
    pub fn should_send_and_record(&mut self, key: &str, now: u64) -> bool {
        if let Some(last) = self.last_sent.get(key) {
            if now.saturating_sub(*last) <= self.config.cooldown_ms {
                debug!(key, "alert suppressed by cooldown");
                return false;
            }
        }

        self.last_sent.insert(key.to_string(), now);

        if self.last_sent.len() > self.config.cleanup_threshold {
            self.cleanup(now);
        }

        true
    }

    /// Drops entries older than the configured max age.
    /// Returns the number of entries removed.
    pub fn cleanup(&mut self, now: u64) -> usize {
        let max_age = self.config.max_age_ms;
        let before = self.last_sent.len();
        self.last_sent
            .retain(|_, last| now.saturating_sub(*last) <= max_age);
        before - self.last_sent.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.last_sent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager(cooldown_ms: u64) -> AlertCooldownManager {
        AlertCooldownManager::new(AlertCooldownConfig {
            cooldown_ms,
            max_age_ms: 3_600_000,
            cleanup_threshold: 1_000,
        })
    }

    #[test]
    fn test_suppresses_within_cooldown_window() {
        let mut cooldowns = manager(1_000);

        assert!(cooldowns.should_send_and_record("SERVICE_UNHEALTHY_detector", 10_000));
        // Anywhere inside the window, including the boundary itself,
        // is suppressed.
        assert!(!cooldowns.should_send_and_record("SERVICE_UNHEALTHY_detector", 10_500));
        assert!(!cooldowns.should_send_and_record("SERVICE_UNHEALTHY_detector", 11_000));
        // One millisecond past the window sends again.
        assert!(cooldowns.should_send_and_record("SERVICE_UNHEALTHY_detector", 11_001));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut cooldowns = manager(1_000);

        assert!(cooldowns.should_send_and_record("A", 10_000));
        assert!(cooldowns.should_send_and_record("B", 10_000));
        assert!(!cooldowns.should_send_and_record("A", 10_100));
    }

    #[test]
    fn test_cleanup_drops_stale_entries() {
        let mut cooldowns = manager(1_000);

        assert!(cooldowns.should_send_and_record("old", 0));
        assert!(cooldowns.should_send_and_record("fresh", 3_599_500));

        let removed = cooldowns.cleanup(3_600_500);
        assert_eq!(removed, 1);
        assert_eq!(cooldowns.tracked_keys(), 1);
    }

    #[test]
    fn test_auto_cleanup_past_threshold() {
        let mut cooldowns = AlertCooldownManager::new(AlertCooldownConfig {
            cooldown_ms: 10,
            max_age_ms: 100,
            cleanup_threshold: 3,
        });

        assert!(cooldowns.should_send_and_record("a", 0));
        assert!(cooldowns.should_send_and_record("b", 0));
        assert!(cooldowns.should_send_and_record("c", 0));

        // The fourth insert pushes the map past the threshold with
        // every earlier entry now stale, so the map shrinks back.
        assert!(cooldowns.should_send_and_record("d", 500));
        assert_eq!(cooldowns.tracked_keys(), 1);
    }
}
