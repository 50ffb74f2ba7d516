//! Bounded deduplication window.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Window {
    seen: HashMap<String, (Instant, String)>,
    order: VecDeque<(Instant, String)>,
}

impl Window {
    fn evict(&mut self, now: Instant, ttl: Duration, max_entries: usize) {
        while let Some((at, id)) = self.order.front() {
            let expired = now.saturating_duration_since(*at) >= ttl;
            if !expired && self.order.len() <= max_entries {
                break;
            }
            if self.seen.get(id).is_some_and(|(seen_at, _)| seen_at == at) {
                self.seen.remove(id);
            }
            self.order.pop_front();
        }
    }
}

/// Remembers event ids for a TTL, up to a maximum number of entries.
///
/// Each id maps to the execution it started, so a redelivery can be
/// answered with the original execution id.
#[derive(Debug)]
pub struct DedupWindow {
    ttl: Duration,
    max_entries: usize,
    window: Mutex<Window>,
}

impl DedupWindow {
    /// Creates a window. `max_entries` is clamped to at least one.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            window: Mutex::new(Window::default()),
        }
    }

    /// Records `event_id` as starting `execution_id` unless it is already
    /// in the window, in which case the earlier execution id is returned.
    ///
    /// The check and the insert happen under one lock.
    pub fn claim(&self, event_id: &str, execution_id: &str) -> Option<String> {
        self.claim_at(event_id, execution_id, Instant::now())
    }

    fn claim_at(&self, event_id: &str, execution_id: &str, now: Instant) -> Option<String> {
        let mut window = self.window.lock();
        window.evict(now, self.ttl, self.max_entries);

        if let Some((_, existing)) = window.seen.get(event_id) {
            return Some(existing.clone());
        }

        window
            .seen
            .insert(event_id.to_string(), (now, execution_id.to_string()));
        window.order.push_back((now, event_id.to_string()));
        window.evict(now, self.ttl, self.max_entries);
        None
    }

    /// Drops `event_id` from the window.
    pub fn forget(&self, event_id: &str) {
        let mut window = self.window.lock();
        if window.seen.remove(event_id).is_some() {
            window.order.retain(|(_, id)| id != event_id);
        }
    }

    /// Number of ids currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.window.lock().seen.len()
    }

    /// Returns true if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
