//! Per-venue API-weight budgets. One token bucket per venue, refilled at
//! the venue's declared weight per minute; loops that would overdraw defer
//! their work instead of queueing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::model::VenueId;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(weight_per_minute: u32) -> Self {
        let capacity = weight_per_minute as f64;
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    }

    fn try_acquire(&mut self, weight: f64) -> bool {
        self.refill();
        if self.tokens < weight {
            return false;
        }
        self.tokens -= weight;
        true
    }
}

/// Budget registry shared by all loops. Unknown venues are unlimited.
pub struct RateBudgets {
    buckets: Mutex<HashMap<VenueId, TokenBucket>>,
}

impl RateBudgets {
    pub fn new(limits: &HashMap<VenueId, u32>) -> Self {
        let buckets = limits
            .iter()
            .map(|(venue, &weight)| (venue.clone(), TokenBucket::new(weight)))
            .collect();
        RateBudgets {
            buckets: Mutex::new(buckets),
        }
    }

    /// Deduct `weight` from the venue's bucket. Returns false (and deducts
    /// nothing) when the call would drive the bucket negative — the caller
    /// defers, never blocks.
    pub fn try_acquire(&self, venue: &str, weight: f64) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        match buckets.get_mut(venue) {
            Some(bucket) => bucket.try_acquire(weight),
            None => true,
        }
    }

    /// Acquire across every venue in one shot; either all succeed or none
    /// are charged. Loops touching all venues use this.
    pub fn try_acquire_all(&self, venues: &[VenueId], weight: f64) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let affordable = venues.iter().all(|venue| match buckets.get_mut(venue) {
            Some(bucket) => {
                bucket.refill();
                bucket.tokens >= weight
            }
            None => true,
        });
        if !affordable {
            return false;
        }
        for venue in venues {
            if let Some(bucket) = buckets.get_mut(venue) {
                bucket.tokens -= weight;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budgets(weight: u32) -> RateBudgets {
        let mut limits = HashMap::new();
        limits.insert("a".to_string(), weight);
        RateBudgets::new(&limits)
    }

    #[test]
    fn bucket_denies_past_capacity() {
        let budgets = budgets(60);
        assert!(budgets.try_acquire("a", 40.0));
        assert!(!budgets.try_acquire("a", 40.0));
        // Nothing was charged on the failed attempt
        assert!(budgets.try_acquire("a", 20.0));
    }

    #[test]
    fn unknown_venue_is_unlimited() {
        let budgets = budgets(1);
        assert!(budgets.try_acquire("other", 1e9));
    }

    #[test]
    fn acquire_all_is_atomic() {
        let mut limits = HashMap::new();
        limits.insert("a".to_string(), 60u32);
        limits.insert("b".to_string(), 10u32);
        let budgets = RateBudgets::new(&limits);
        // b cannot afford 20, so a must not be charged either
        assert!(!budgets.try_acquire_all(&["a".into(), "b".into()], 20.0));
        assert!(budgets.try_acquire("a", 60.0));
    }
}
