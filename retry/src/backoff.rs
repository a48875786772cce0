//! Backoff delay calculation
//!
//! `delay(policy, retry)` is the sleep before the next attempt, where
//! `retry` is the number of attempts already made: 1 before the second
//! attempt, 2 before the third, and so on.
//!
//! - fixed: `initial_delay`
//! - linear: `initial_delay * (retry + 1)`
//! - exponential: `initial_delay * multiplier^retry`
//!
//! The result is clamped to `max_delay`. Jitter adds up to 10% on top of
//! the clamped value and never shortens it. Pre-jitter values are cached
//! per policy shape; the cache is dropped wholesale once it grows past its
//! capacity.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::policy::{BackoffStrategy, Policy};

/// Entries held before the cache is cleared
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Upper bound of the jitter term as a fraction of the clamped delay
pub const JITTER_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    strategy: BackoffStrategy,
    retry: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier_bits: u64,
    max_attempts: u32,
}

impl CacheKey {
    fn new(policy: &Policy, retry: u32) -> Self {
        Self {
            strategy: policy.backoff_strategy,
            retry,
            initial_delay: policy.initial_delay,
            max_delay: policy.max_delay,
            multiplier_bits: policy.multiplier.to_bits(),
            max_attempts: policy.max_attempts,
        }
    }
}

/// Computes inter-attempt delays with a bounded cache and a shared jitter source
pub struct BackoffCalculator {
    cache: RwLock<HashMap<CacheKey, Duration>>,
    capacity: usize,
    rng: Mutex<StdRng>,
}

impl BackoffCalculator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            capacity,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic jitter, for tests and reproducible runs.
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            capacity,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Delay before the next attempt, jitter included.
    pub fn delay(&self, policy: &Policy, retry: u32) -> Duration {
        let base = self.base_delay(policy, retry);
        if policy.jitter {
            base.saturating_add(self.jitter(base))
        } else {
            base
        }
    }

    /// Clamped delay without jitter. Served from the cache when possible.
    pub fn base_delay(&self, policy: &Policy, retry: u32) -> Duration {
        let key = CacheKey::new(policy, retry);

        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return *cached;
        }

        let delay = compute_delay(policy, retry);

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() > self.capacity {
            tracing::debug!(entries = cache.len(), "Backoff delay cache full, clearing");
            cache.clear();
        }
        cache.insert(key, delay);

        delay
    }

    pub fn cache_len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn jitter(&self, base: Duration) -> Duration {
        let fraction = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            rng.random_range(0.0..=JITTER_FRACTION)
        };
        base.mul_f64(fraction)
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackoffCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffCalculator")
            .field("capacity", &self.capacity)
            .field("cached", &self.cache_len())
            .finish_non_exhaustive()
    }
}

/// Pure pre-jitter delay. Saturates at `max_delay` instead of overflowing.
pub fn compute_delay(policy: &Policy, retry: u32) -> Duration {
    let raw = match policy.backoff_strategy {
        BackoffStrategy::Fixed => Some(policy.initial_delay),
        BackoffStrategy::Linear => policy.initial_delay.checked_mul(retry.saturating_add(1)),
        BackoffStrategy::Exponential => {
            let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
            let nanos = policy.initial_delay.as_nanos() as f64 * policy.multiplier.powi(exponent);
            if nanos.is_finite() && nanos >= 0.0 && nanos < policy.max_delay.as_nanos() as f64 {
                Some(Duration::from_nanos(nanos.round() as u64))
            } else {
                None
            }
        }
    };

    match raw {
        Some(delay) => delay.min(policy.max_delay),
        None => policy.max_delay,
    }
}
