use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::event::SourceId;

/// Configuration for per-source connection-event flap suppression.
#[derive(Clone, Debug)]
pub struct ThrottleConfig {
    /// Window over which repeats of the same (source, state) are counted.
    pub window: Duration,
    /// Occurrences admitted per window before later ones are dropped.
    pub max_repeats: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            max_repeats: 3,
        }
    }
}

#[derive(Debug)]
struct ThrottleEntry {
    window_start: Instant,
    count: u32,
}

/// Suppresses redundant connection-state events per (source, state) pair.
///
/// A flapping gateway connection can emit the same transition dozens of
/// times a second; beyond `max_repeats` within the window, later occurrences
/// are dropped before they reach the queue.
#[derive(Debug, Default)]
pub struct ConnectionThrottle {
    config: ThrottleConfig,
    entries: HashMap<(SourceId, String), ThrottleEntry>,
}

impl ConnectionThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Whether this occurrence should be dropped. Counts the occurrence
    /// either way.
    pub fn should_drop(&mut self, source: &SourceId, state: &str, now: Instant) -> bool {
        let key = (source.clone(), state.to_string());
        let entry = self.entries.entry(key).or_insert(ThrottleEntry {
            window_start: now,
            count: 0,
        });

        if now.saturating_duration_since(entry.window_start) > self.config.window {
            entry.window_start = now;
            entry.count = 0;
        }

        entry.count += 1;
        entry.count > self.config.max_repeats
    }

    /// Drop expired entries so flapping sources don't pin memory forever.
    pub fn prune(&mut self, now: Instant) {
        let window = self.config.window;
        self.entries.retain(|_, entry| {
            now.saturating_duration_since(entry.window_start) <= window
        });
    }

    pub fn tracked_pairs(&self) -> usize {
        self.entries.len()
    }
}
