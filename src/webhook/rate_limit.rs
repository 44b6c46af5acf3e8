//! Per-sender acceptance rate limiting.
//!
//! A sliding-window limiter keyed by sender identity (the guest's phone
//! number). It bounds *acceptance* per sender, not total throughput, and
//! keeps its own cardinality bounded: stale senders are swept
//! periodically, and under key pressure the least-recently-active sender
//! is evicted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::PipelineError;

/// How often the limiter sweeps senders with no recent requests.
const SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes

pub struct SenderRateLimiter {
    limit_per_window: u32,
    window: Duration,
    max_senders: usize,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SenderRateLimiter {
    pub fn new(limit_per_window: u32, window: Duration, max_senders: usize) -> Self {
        Self {
            limit_per_window,
            window,
            max_senders: max_senders.max(1),
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    /// Record one accepted message for `sender`, or reject when the window
    /// ceiling is already reached. Rejection does not consume a slot.
    pub fn check_limit(&self, sender: &str) -> Result<(), PipelineError> {
        if self.allow(sender) {
            Ok(())
        } else {
            Err(PipelineError::RateLimitExceeded {
                sender: sender.to_string(),
                limit: self.limit_per_window,
                window: self.window,
            })
        }
    }

    fn prune_stale(requests: &mut HashMap<String, Vec<Instant>>, cutoff: Instant) {
        requests.retain(|_, timestamps| {
            timestamps.retain(|t| *t > cutoff);
            !timestamps.is_empty()
        });
    }

    fn allow(&self, sender: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or_else(Instant::now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        // Periodic sweep: drop senders with no requests in the window.
        if last_sweep.elapsed() >= Duration::from_secs(SWEEP_INTERVAL_SECS) {
            Self::prune_stale(requests, cutoff);
            *last_sweep = now;
        }

        if !requests.contains_key(sender) && requests.len() >= self.max_senders {
            // Opportunistic stale cleanup before eviction under pressure.
            Self::prune_stale(requests, cutoff);
            *last_sweep = now;

            if requests.len() >= self.max_senders {
                let evict_key = requests
                    .iter()
                    .min_by_key(|(_, timestamps)| timestamps.last().copied().unwrap_or(cutoff))
                    .map(|(k, _)| k.clone());
                if let Some(evict_key) = evict_key {
                    requests.remove(&evict_key);
                }
            }
        }

        let entry = requests.entry(sender.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            return false;
        }

        entry.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_window_ceiling() {
        let limiter = SenderRateLimiter::new(2, Duration::from_secs(60), 100);
        assert!(limiter.check_limit("4915123456789").is_ok());
        assert!(limiter.check_limit("4915123456789").is_ok());
        assert!(limiter.check_limit("4915123456789").is_err());
        // Other senders are unaffected.
        assert!(limiter.check_limit("4915199999999").is_ok());
    }

    #[test]
    fn rejection_carries_sender_and_ceiling() {
        let limiter = SenderRateLimiter::new(1, Duration::from_secs(60), 100);
        limiter.check_limit("49151").unwrap();
        let err = limiter.check_limit("49151").unwrap_err();
        match err {
            PipelineError::RateLimitExceeded { sender, limit, .. } => {
                assert_eq!(sender, "49151");
                assert_eq!(limit, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejection_does_not_consume_a_slot() {
        let limiter = SenderRateLimiter::new(1, Duration::from_secs(60), 100);
        limiter.check_limit("49151").unwrap();

        assert!(limiter.check_limit("49151").is_err());
        assert!(limiter.check_limit("49151").is_err());

        // Aging the only recorded timestamp past the window frees exactly
        // one slot; repeated rejections must not have added more.
        {
            let mut guard = limiter.requests.lock();
            let stale = Instant::now()
                .checked_sub(Duration::from_secs(61))
                .unwrap();
            guard.0.insert("49151".to_string(), vec![stale]);
        }
        assert!(limiter.check_limit("49151").is_ok());
        assert!(limiter.check_limit("49151").is_err());
    }

    #[test]
    fn zero_limit_disables_rate_limiting() {
        let limiter = SenderRateLimiter::new(0, Duration::from_secs(60), 10);
        for _ in 0..100 {
            assert!(limiter.check_limit("any-sender").is_ok());
        }
    }

    #[test]
    fn sweep_removes_stale_senders() {
        let limiter = SenderRateLimiter::new(10, Duration::from_secs(60), 100);
        assert!(limiter.check_limit("s1").is_ok());
        assert!(limiter.check_limit("s2").is_ok());
        assert!(limiter.check_limit("s3").is_ok());

        {
            let mut guard = limiter.requests.lock();
            assert_eq!(guard.0.len(), 3);
            // Force a sweep and make s2/s3 stale.
            guard.1 = Instant::now()
                .checked_sub(Duration::from_secs(SWEEP_INTERVAL_SECS + 1))
                .unwrap();
            guard.0.get_mut("s2").unwrap().clear();
            guard.0.get_mut("s3").unwrap().clear();
        }

        assert!(limiter.check_limit("s1").is_ok());

        let guard = limiter.requests.lock();
        assert_eq!(guard.0.len(), 1);
        assert!(guard.0.contains_key("s1"));
    }

    #[test]
    fn bounded_cardinality_evicts_least_recently_active_sender() {
        let limiter = SenderRateLimiter::new(5, Duration::from_secs(60), 2);
        assert!(limiter.check_limit("s1").is_ok());
        assert!(limiter.check_limit("s2").is_ok());
        assert!(limiter.check_limit("s3").is_ok());

        let guard = limiter.requests.lock();
        assert_eq!(guard.0.len(), 2);
        assert!(guard.0.contains_key("s2"));
        assert!(guard.0.contains_key("s3"));
    }
}
