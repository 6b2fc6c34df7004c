use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerKey {
    pub topic: String,
    pub image: String,
}

impl TriggerKey {
    pub fn new(topic: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            image: image.into(),
        }
    }
}

/// Armed timeouts, one per `(topic, image)`. The first arm wins and is never
/// pushed back by later files.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<TriggerKey, Instant>,
}

impl PendingTable {
    /// Arm `key` unless it already is. Returns whether it was armed now.
    pub fn arm(&mut self, key: TriggerKey, fire_at: Instant) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, fire_at);
        true
    }

    pub fn fire_at(&self, key: &TriggerKey) -> Option<Instant> {
        self.entries.get(key).copied()
    }

    /// Drop every entry for `topic`. Returns how many were dropped.
    pub fn clear_topic(&mut self, topic: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.topic != topic);
        before - self.entries.len()
    }

    /// Remove and return the entries due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TriggerKey> {
        let mut due: Vec<(TriggerKey, Instant)> = self
            .entries
            .iter()
            .filter(|(_, fire_at)| **fire_at <= now)
            .map(|(key, fire_at)| (key.clone(), *fire_at))
            .collect();
        for (key, _) in &due {
            self.entries.remove(key);
        }
        due.sort_by_key(|(_, fire_at)| *fire_at);
        due.into_iter().map(|(key, _)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
