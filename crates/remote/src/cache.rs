//! Per-key, per-sender message cache
//!
//! Collects one payload per sender for each key (an event, a registration, a request)
//! and answers "have enough distinct senders reported recently?". A newer message from
//! the same sender replaces the older one.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry<S> {
    first_seen: Instant,
    was_ready: bool,
    messages: HashMap<S, (Instant, Vec<u8>)>,
}

/// Message cache keyed by `K`, deduplicating senders of type `S`
#[derive(Debug)]
pub struct MessageCache<K, S> {
    entries: HashMap<K, Entry<S>>,
}

impl<K, S> Default for MessageCache<K, S> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, S> MessageCache<K, S>
where
    K: Eq + Hash + Clone,
    S: Eq + Hash + Clone,
{
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `payload` from `sender`; returns the number of distinct senders for `key`
    pub fn insert(&mut self, key: K, sender: S, now: Instant, payload: Vec<u8>) -> usize {
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            first_seen: now,
            was_ready: false,
            messages: HashMap::new(),
        });
        entry.messages.insert(sender, (now, payload));
        entry.messages.len()
    }

    /// Number of senders whose latest message is at most `max_age` old
    pub fn fresh_count(&self, key: &K, now: Instant, max_age: Duration) -> usize {
        self.entries
            .get(key)
            .map(|e| {
                e.messages
                    .values()
                    .filter(|(at, _)| now.duration_since(*at) <= max_age)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Fresh payloads for `key` once at least `min_count` senders reported
    ///
    /// With `once` set, a key reports ready a single time; later calls return `None`.
    pub fn ready(
        &mut self,
        key: &K,
        min_count: usize,
        now: Instant,
        max_age: Duration,
        once: bool,
    ) -> Option<Vec<Vec<u8>>> {
        let entry = self.entries.get_mut(key)?;
        if once && entry.was_ready {
            return None;
        }

        let payloads: Vec<Vec<u8>> = entry
            .messages
            .values()
            .filter(|(at, _)| now.duration_since(*at) <= max_age)
            .map(|(_, payload)| payload.clone())
            .collect();
        if payloads.len() < min_count {
            return None;
        }

        if once {
            entry.was_ready = true;
        }
        Some(payloads)
    }

    /// Forget one sender's message
    pub fn remove_sender(&mut self, key: &K, sender: &S) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.messages.remove(sender);
        }
    }

    /// Forget a key
    pub fn delete(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop keys first seen more than `max_age` ago; returns how many were dropped
    pub fn delete_older_than(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.duration_since(e.first_seen) <= max_age);
        before - self.entries.len()
    }

    /// Tracked keys
    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
