use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Reconnect delay state: `min(base * multiplier^(attempts-1), max)`, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Counts one more consecutive failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.current()
    }

    /// Delay for the current attempt count without advancing it.
    pub fn current(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        let p = &self.policy;
        let exp = (self.attempts - 1).min(63) as i32;
        let scaled = p.base.as_secs_f64() * p.multiplier.max(1.0).powi(exp);
        if !scaled.is_finite() || scaled >= p.max.as_secs_f64() {
            return p.max.max(p.base);
        }
        Duration::from_secs_f64(scaled)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u64, max: u64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(base),
            max: Duration::from_secs(max),
            multiplier: 2.0,
        }
    }

    #[test]
    fn doubles_up_to_max() {
        let mut b = Backoff::new(policy(5, 60));
        let got: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(got, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(b.attempts(), 6);
    }

    #[test]
    fn delays_never_decrease() {
        let mut b = Backoff::new(BackoffPolicy {
            base: Duration::from_millis(300),
            max: Duration::from_secs(7),
            multiplier: 1.7,
        });
        let mut prev = Duration::ZERO;
        for _ in 0..200 {
            let d = b.next_delay();
            assert!(d >= prev);
            assert!(d <= Duration::from_secs(7));
            prev = d;
        }
        assert_eq!(prev, Duration::from_secs(7));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = Backoff::new(policy(5, 60));
        b.next_delay();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.current(), Duration::ZERO);
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn max_below_base_clamps_to_base() {
        let mut b = Backoff::new(policy(10, 3));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut b = Backoff::new(policy(1, 30));
        for _ in 0..10_000 {
            b.next_delay();
        }
        assert_eq!(b.current(), Duration::from_secs(30));
    }
}
