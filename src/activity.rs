//! Process-local activity tracking for sandbox subdomains.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

/// Tracks the last observed request per sandbox subdomain.
///
/// The tracker is an owned value passed to its collaborators rather than
/// ambient process state. Updates are last-writer-wins with per-key
/// atomicity; a lost update only delays reaping, never advances it. The map
/// is in-memory only and is reseeded from the registry on restart.
#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    /// Subdomain to last-touched timestamp.
    inner: Arc<RwLock<HashMap<Uuid, DateTime<Utc>>>>,
}

impl ActivityTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request for a subdomain as of now.
    pub fn touch(&self, subdomain: Uuid) {
        self.touch_at(subdomain, Utc::now());
    }

    /// Record a request for a subdomain at a given instant.
    pub fn touch_at(&self, subdomain: Uuid, at: DateTime<Utc>) {
        self.inner.write().insert(subdomain, at);
    }

    /// The last observed request for a subdomain, if any.
    pub fn last_activity(&self, subdomain: Uuid) -> Option<DateTime<Utc>> {
        self.inner.read().get(&subdomain).copied()
    }

    /// Drop the entry for a subdomain.
    ///
    /// Called when the sandbox reaches a terminal state.
    pub fn evict(&self, subdomain: Uuid) {
        self.inner.write().remove(&subdomain);
    }

    /// Number of tracked subdomains.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the tracker is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn touch_and_read_back() {
        let tracker = ActivityTracker::new();
        let subdomain = Uuid::new_v4();

        assert!(tracker.last_activity(subdomain).is_none());

        let before = Utc::now();
        tracker.touch(subdomain);
        let recorded = tracker.last_activity(subdomain).unwrap();
        assert!(recorded >= before);
    }

    #[test]
    fn touches_are_last_writer_wins() {
        let tracker = ActivityTracker::new();
        let subdomain = Uuid::new_v4();
        let earlier = Utc::now() - Duration::minutes(10);

        tracker.touch_at(subdomain, earlier);
        let later = Utc::now();
        tracker.touch_at(subdomain, later);

        assert_eq!(tracker.last_activity(subdomain), Some(later));
    }

    #[test]
    fn evict_removes_only_the_given_key() {
        let tracker = ActivityTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        tracker.touch(a);
        tracker.touch(b);
        tracker.evict(a);

        assert!(tracker.last_activity(a).is_none());
        assert!(tracker.last_activity(b).is_some());
        assert_eq!(tracker.len(), 1);
    }
}
