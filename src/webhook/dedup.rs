//! Time-bounded record of recently accepted message ids.
//!
//! The provider redelivers messages whenever it is unhappy with an
//! acknowledgment, sometimes on a second connection before the first
//! request has finished. `accept` therefore performs the seen-check and
//! the mark as one step under a single lock; a separate `seen`-then-`mark`
//! pair would leave a gap two concurrent deliveries can both slip through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

pub struct DedupWindow {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupWindow {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Was `id` accepted within the TTL?
    pub fn seen(&self, id: &str) -> bool {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(id)
            .is_some_and(|first| now.duration_since(*first) < self.ttl)
    }

    /// Record `id` as accepted now. Prefer [`DedupWindow::accept`], which
    /// folds the seen-check and the mark into one atomic step.
    pub fn mark(&self, id: &str) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(id) {
            tracing::warn!(
                capacity = self.max_entries,
                "dedup window at capacity; id not recorded"
            );
            return;
        }
        entries.insert(id.to_string(), Instant::now());
    }

    /// Atomic check-and-set: returns `true` when `id` is new (or its
    /// previous sighting has aged out) and the caller should process it,
    /// `false` when it is a retransmission to drop.
    ///
    /// When the window is full, new ids are still reported as processable
    /// but are not recorded — a capacity warning is logged instead, so an
    /// id-flood degrades dedup rather than memory.
    pub fn accept(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(first) = entries.get(id) {
            if now.duration_since(*first) < self.ttl {
                return false;
            }
        }

        if entries.len() >= self.max_entries && !entries.contains_key(id) {
            // Reclaim expired entries before giving up on recording.
            Self::prune(&mut entries, now, self.ttl);
            if entries.len() >= self.max_entries {
                tracing::warn!(
                    capacity = self.max_entries,
                    "dedup window at capacity; processing without recording id"
                );
                return true;
            }
        }

        entries.insert(id.to_string(), now);
        true
    }

    /// Drop entries older than the TTL; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        Self::prune(&mut entries, now, self.ttl);
        before - entries.len()
    }

    fn prune(entries: &mut HashMap<String, Instant>, now: Instant, ttl: Duration) {
        entries.retain(|_, first| now.duration_since(*first) < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Background sweep at a fixed interval. The task runs until aborted;
    /// the gateway aborts it on shutdown.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    tracing::debug!(removed, remaining = self.len(), "dedup sweep");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_admits_once_per_ttl() {
        let window = DedupWindow::new(Duration::from_secs(300), 100);
        assert!(window.accept("wamid.m1"));
        assert!(!window.accept("wamid.m1"));
        assert!(window.accept("wamid.m2"));
    }

    #[test]
    fn seen_and_mark_match_accept_semantics() {
        let window = DedupWindow::new(Duration::from_secs(300), 100);
        assert!(!window.seen("wamid.m1"));
        window.mark("wamid.m1");
        assert!(window.seen("wamid.m1"));
        assert!(!window.accept("wamid.m1"));
    }

    #[test]
    fn expired_ids_are_accepted_again() {
        let window = DedupWindow::new(Duration::from_secs(300), 100);
        assert!(window.accept("wamid.m1"));

        // Backdate the sighting past the TTL.
        {
            let mut entries = window.entries.lock();
            let stale = Instant::now()
                .checked_sub(Duration::from_secs(301))
                .unwrap();
            entries.insert("wamid.m1".to_string(), stale);
        }

        assert!(!window.seen("wamid.m1"));
        assert!(window.accept("wamid.m1"));
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let window = DedupWindow::new(Duration::from_secs(300), 100);
        assert!(window.accept("fresh"));
        {
            let mut entries = window.entries.lock();
            let stale = Instant::now()
                .checked_sub(Duration::from_secs(301))
                .unwrap();
            entries.insert("stale-1".to_string(), stale);
            entries.insert("stale-2".to_string(), stale);
        }

        assert_eq!(window.sweep(), 2);
        assert_eq!(window.len(), 1);
        assert!(window.seen("fresh"));
    }

    #[test]
    fn full_window_processes_but_stops_recording() {
        let window = DedupWindow::new(Duration::from_secs(300), 2);
        assert!(window.accept("m1"));
        assert!(window.accept("m2"));

        // Over capacity: still processable, not recorded.
        assert!(window.accept("m3"));
        assert_eq!(window.len(), 2);
        assert!(!window.seen("m3"));

        // Known ids keep deduplicating at capacity.
        assert!(!window.accept("m1"));
    }

    #[test]
    fn full_window_reclaims_expired_entries_first() {
        let window = DedupWindow::new(Duration::from_secs(300), 2);
        assert!(window.accept("m1"));
        {
            let mut entries = window.entries.lock();
            let stale = Instant::now()
                .checked_sub(Duration::from_secs(301))
                .unwrap();
            entries.insert("old".to_string(), stale);
        }

        assert!(window.accept("m2"));
        assert!(window.seen("m2"));
        assert!(!window.seen("old"));
    }

    #[tokio::test]
    async fn sweeper_task_prunes_in_background() {
        let window = Arc::new(DedupWindow::new(Duration::from_millis(10), 100));
        {
            let mut entries = window.entries.lock();
            let stale = Instant::now()
                .checked_sub(Duration::from_millis(50))
                .unwrap();
            entries.insert("old".to_string(), stale);
        }

        let handle = window.clone().spawn_sweeper(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();

        assert!(window.is_empty());
    }
}
