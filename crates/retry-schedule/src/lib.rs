//! Lazy backoff interval sequences used to pace both the peer connection
//! orchestrator's address attempts and sustained subscription reconnects.
//!
//! The schedule is deliberately *not* a `Vec<Duration>` — it is generated one
//! interval at a time so a caller can stop consuming it the moment it
//! connects, without having pre-computed (and potentially slept through) the
//! whole tail of a long backoff.

use std::time::Duration;

/// Source of randomness for jitter. Injected rather than read from a
/// thread-local RNG so schedules are reproducible in tests.
pub trait Entropy: Send + Sync {
    /// Returns 4 bytes worth of entropy as a `u32`.
    fn next_u32(&self) -> u32;
}

/// `rand`-backed entropy source used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandEntropy;

impl Entropy for RandEntropy {
    fn next_u32(&self) -> u32 {
        rand::random()
    }
}

/// Fixed-sequence entropy source for deterministic tests.
#[derive(Debug)]
pub struct FixedEntropy(std::sync::atomic::AtomicU32);

impl FixedEntropy {
    pub fn new(value: u32) -> Self {
        Self(std::sync::atomic::AtomicU32::new(value))
    }
}

impl Entropy for FixedEntropy {
    fn next_u32(&self) -> u32 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Parameters controlling a [`RetrySchedule`].
#[derive(Debug, Clone)]
pub struct RetryParams {
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub maximum_interval: Option<Duration>,
    pub maximum_count: Option<u64>,
    pub timeout: Option<Duration>,
    pub jitter_factor: f64,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_factor: 2.0,
            maximum_interval: None,
            maximum_count: None,
            timeout: None,
            jitter_factor: 0.0,
        }
    }
}

/// A finite or infinite lazy sequence of backoff intervals.
///
/// See `spec.md` §4.1 for the exact algorithm. With `jitter_factor = 0.0`
/// the sequence is exactly `initial * factor^n` capped at `maximum_interval`.
/// With a `timeout` set, the final yielded interval is clamped so the
/// cumulative sum of yielded (unjittered) intervals equals exactly
/// `timeout`, and the sequence then ends.
pub struct RetrySchedule<E: Entropy = RandEntropy> {
    params: RetryParams,
    entropy: E,
    attempt: u64,
    elapsed: Duration,
    done: bool,
}

impl RetrySchedule<RandEntropy> {
    pub fn new(params: RetryParams) -> Self {
        Self::with_entropy(params, RandEntropy)
    }
}

impl<E: Entropy> RetrySchedule<E> {
    pub fn with_entropy(params: RetryParams, entropy: E) -> Self {
        Self {
            params,
            entropy,
            attempt: 0,
            elapsed: Duration::ZERO,
            done: false,
        }
    }

    fn base_interval(&self, n: u64) -> Duration {
        let initial_ms = self.params.initial_interval.as_secs_f64() * 1000.0;
        let scaled_ms = initial_ms * self.params.backoff_factor.powi(n as i32);
        let capped_ms = match self.params.maximum_interval {
            Some(max) => scaled_ms.min(max.as_secs_f64() * 1000.0),
            None => scaled_ms,
        };
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    fn entropy01(&self) -> f64 {
        self.entropy.next_u32() as f64 / (u32::MAX as f64 + 1.0)
    }
}

impl<E: Entropy> Iterator for RetrySchedule<E> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.done {
            return None;
        }

        if let Some(max_count) = self.params.maximum_count {
            if self.attempt >= max_count {
                self.done = true;
                return None;
            }
        }

        let base = self.base_interval(self.attempt);

        if let Some(timeout) = self.params.timeout {
            if self.elapsed + base > timeout {
                self.done = true;
                if self.elapsed >= timeout {
                    return None;
                }
                let remainder = timeout - self.elapsed;
                self.elapsed = timeout;
                self.attempt += 1;
                return Some(remainder);
            }
        }

        self.elapsed += base;
        self.attempt += 1;

        let jittered_ms =
            base.as_secs_f64() * 1000.0 * (1.0 + self.entropy01() * self.params.jitter_factor);
        Some(Duration::from_millis(jittered_ms.max(0.0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn no_jitter_is_exact_exponential_backoff() {
        let params = RetryParams {
            initial_interval: Duration::from_secs(1),
            backoff_factor: 2.0,
            maximum_count: Some(4),
            ..Default::default()
        };
        let got: Vec<_> = RetrySchedule::new(params).collect();
        assert_eq!(got, vec![ms(1000), ms(2000), ms(4000), ms(8000)]);
    }

    #[test]
    fn maximum_count_zero_yields_empty_sequence() {
        let params = RetryParams {
            maximum_count: Some(0),
            ..Default::default()
        };
        let got: Vec<_> = RetrySchedule::new(params).collect();
        assert!(got.is_empty());
    }

    #[test]
    fn timeout_clamps_final_interval_to_exact_total() {
        let params = RetryParams {
            initial_interval: Duration::from_secs(1),
            backoff_factor: 2.0,
            timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let got: Vec<_> = RetrySchedule::new(params).collect();
        assert_eq!(got, vec![ms(1000), ms(2000), ms(4000), ms(3000)]);
        assert_eq!(got.iter().sum::<Duration>(), Duration::from_secs(10));
    }

    #[test]
    fn maximum_interval_caps_growth() {
        let params = RetryParams {
            initial_interval: Duration::from_secs(1),
            backoff_factor: 2.0,
            maximum_interval: Some(Duration::from_secs(5)),
            maximum_count: Some(5),
            ..Default::default()
        };
        let got: Vec<_> = RetrySchedule::new(params).collect();
        assert_eq!(got, vec![ms(1000), ms(2000), ms(4000), ms(5000), ms(5000)]);
    }

    #[test]
    fn jitter_factor_scales_within_expected_bounds() {
        let params = RetryParams {
            initial_interval: Duration::from_secs(1),
            backoff_factor: 1.0,
            maximum_count: Some(1),
            jitter_factor: 0.25,
            ..Default::default()
        };
        // entropy01 = u32::MAX / (u32::MAX + 1) ~= 1.0, so interval should be
        // close to initial * 1.25 but never exceed it.
        let got: Vec<_> = RetrySchedule::with_entropy(params, FixedEntropy::new(u32::MAX))
            .collect();
        assert_eq!(got.len(), 1);
        assert!(got[0] >= ms(1000) && got[0] <= ms(1250));
    }

    #[test]
    fn fractional_backoff_factor_is_supported() {
        let params = RetryParams {
            initial_interval: Duration::from_secs(4),
            backoff_factor: 0.5,
            maximum_count: Some(3),
            ..Default::default()
        };
        let got: Vec<_> = RetrySchedule::new(params).collect();
        assert_eq!(got, vec![ms(4000), ms(2000), ms(1000)]);
    }

    #[test]
    fn infinite_schedule_can_be_taken_from() {
        let params = RetryParams {
            initial_interval: Duration::from_millis(100),
            backoff_factor: 1.0,
            ..Default::default()
        };
        let got: Vec<_> = RetrySchedule::new(params).take(3).collect();
        assert_eq!(got, vec![ms(100), ms(100), ms(100)]);
    }
}
