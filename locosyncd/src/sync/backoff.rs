use rand::Rng;
use std::time::Duration;

/// Delay before retrying an unfinished sync run.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    /// Full jitter, but never below half the exponential step so a run
    /// cut short is not retried immediately.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn grows_exponentially_up_to_cap() {
        let backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(240), false);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(240),
                Duration::from_secs(240),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_upper_half() {
        let backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(240), true);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..8 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            let step = Duration::from_secs(30 * (1 << attempt.min(3)));
            assert!(delay <= step);
            assert!(delay >= step / 2);
        }
    }
}
