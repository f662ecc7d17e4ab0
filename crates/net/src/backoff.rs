//! Exponential reconnect backoff with optional jitter.

use rand::Rng as _;
use std::time::Duration;

pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
    pub factor: u32,
    pub jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: u32, jitter: bool) -> Backoff {
        Backoff {
            min,
            max,
            factor,
            jitter,
            attempt: 0,
        }
    }

    /// The reconnect delay the client uses: 5s..10s, doubling, jittered.
    pub fn reconnect() -> Backoff {
        Backoff::new(Duration::from_secs(5), Duration::from_secs(10), 2, true)
    }

    /// Next delay; grows by `factor` per attempt and saturates at `max`.
    pub fn duration(&mut self) -> Duration {
        let factor = self.factor.saturating_pow(self.attempt).max(1);
        self.attempt = self.attempt.saturating_add(1);
        let base = self.min.saturating_mul(factor).min(self.max);
        if !self.jitter {
            return base;
        }
        // jitter inside [min, base]
        let low = self.min.as_millis() as u64;
        let high = (base.as_millis() as u64).max(low + 1);
        let ms = rand::thread_rng().gen_range(low..high);
        Duration::from_millis(ms)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_saturates() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(10), 2, false);
        assert_eq!(b.duration(), Duration::from_secs(5));
        assert_eq!(b.duration(), Duration::from_secs(10));
        assert_eq!(b.duration(), Duration::from_secs(10));
        b.reset();
        assert_eq!(b.duration(), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut b = Backoff::reconnect();
        for _ in 0..20 {
            let d = b.duration();
            assert!(d >= Duration::from_secs(5) && d <= Duration::from_secs(10));
        }
    }
}
