//! Retry and backoff policy.
//!
//! [`RetryPolicy::backoff`] is a pure function of the number of finished
//! attempts. Jitter is applied on top by [`RetryPolicy::jittered`] and is
//! bounded so that successive delays never shrink.

use crate::clock::after;
use crate::errors::ConfigError;
use crate::schema::Job;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff: `base * factor^attempts`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay after the first failure (milliseconds)
    pub base_ms: u64,
    /// Growth factor per failed attempt
    pub factor: f64,
    /// Upper bound for any single delay (milliseconds)
    pub cap_ms: u64,
    /// Random extra delay as a fraction of the computed delay
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 2_000,
            factor: 2.0,
            cap_ms: 128_000,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy without jitter, mostly useful for tests.
    pub fn fixed(base: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            base_ms: millis(base),
            factor,
            cap_ms: millis(cap),
            jitter_ratio: 0.0,
        }
    }

    /// Reject policies whose delays could shrink from one attempt to the next.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ConfigError::invalid(format_args!(
                "retry factor must be >= 1, got {}",
                self.factor
            )));
        }
        if !(0.0..=self.factor - 1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::invalid(format_args!(
                "retry jitter ratio must be within 0..={}, got {}",
                self.factor - 1.0,
                self.jitter_ratio
            )));
        }
        if self.cap_ms < self.base_ms {
            return Err(ConfigError::invalid("retry cap must not be below the base delay"));
        }
        Ok(())
    }

    /// Delay before the next attempt, given how many attempts already failed.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let scaled = self.base_ms as f64 * self.factor.powi(exponent);
        Duration::from_millis(clamp_ms(scaled, self.cap_ms))
    }

    /// [`Self::backoff`] plus up to `jitter_ratio` of random extra delay,
    /// still bounded by the cap.
    pub fn jittered<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let delay = self.backoff(attempts);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }

        let span = millis(delay) as f64 * self.jitter_ratio;
        let extra = rng.gen_range(0.0..=span);
        Duration::from_millis(clamp_ms(millis(delay) as f64 + extra, self.cap_ms))
    }

    /// What to do with a job whose current attempt just failed.
    ///
    /// Permanent failures and exhausted jobs go to the dead letter state,
    /// everything else is retried after [`Self::jittered`].
    pub fn disposition(&self, job: &Job, permanent: bool, now: DateTime<Utc>) -> Disposition {
        if permanent || !job.has_attempts_left() {
            return Disposition::DeadLetter;
        }

        let attempts = u32::try_from(job.attempts).unwrap_or(0);
        let delay = self.jittered(attempts, &mut rand::thread_rng());
        Disposition::Retry {
            next_run_at: after(now, delay),
        }
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back to `pending`, claimable again at `next_run_at`
    Retry {
        /// Earliest next claim
        next_run_at: DateTime<Utc>,
    },
    /// Terminal failure
    DeadLetter,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn clamp_ms(value: f64, cap_ms: u64) -> u64 {
    if value.is_nan() || value <= 0.0 {
        return 0;
    }
    let cap = cap_ms as f64;
    if value >= cap { cap_ms } else { value as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NewJob;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn job(attempts: i32, max_attempts: i32) -> Job {
        let mut job = NewJob {
            job_type: "test".into(),
            idempotency_key: format!("test:{attempts}"),
            payload: serde_json::Value::Null,
            max_attempts,
        }
        .into_job(Utc::now());
        job.attempts = attempts;
        job
    }

    #[test]
    fn default_policy_doubles_from_two_seconds_up_to_the_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..9).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 128, 128, 128]);
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(128));
    }

    #[test]
    fn jitter_never_exceeds_the_cap() {
        let policy = RetryPolicy {
            jitter_ratio: 1.0,
            ..RetryPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            assert!(policy.jittered(6, &mut rng) <= Duration::from_secs(128));
        }
    }

    #[test]
    fn validate_rejects_shrinking_policies() {
        assert!(RetryPolicy::default().validate().is_ok());

        let too_much_jitter = RetryPolicy {
            factor: 1.5,
            jitter_ratio: 0.6,
            ..RetryPolicy::default()
        };
        assert!(too_much_jitter.validate().is_err());

        let shrinking = RetryPolicy {
            factor: 0.5,
            ..RetryPolicy::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn exhausted_and_permanent_failures_are_dead_lettered() {
        let policy = RetryPolicy::fixed(Duration::from_secs(2), 2.0, Duration::from_secs(128));
        let now = Utc::now();

        assert_eq!(
            policy.disposition(&job(0, 5), false, now),
            Disposition::Retry {
                next_run_at: now + chrono::TimeDelta::seconds(2)
            }
        );
        assert_eq!(
            policy.disposition(&job(3, 5), false, now),
            Disposition::Retry {
                next_run_at: now + chrono::TimeDelta::seconds(16)
            }
        );
        assert_eq!(policy.disposition(&job(4, 5), false, now), Disposition::DeadLetter);
        assert_eq!(policy.disposition(&job(0, 5), true, now), Disposition::DeadLetter);
    }

    proptest! {
        #[test]
        fn successive_delays_never_shrink(
            base_ms in 1u64..10_000,
            factor in 1.0f64..4.0,
            cap_ms in 10_000u64..600_000,
            jitter in 0.0f64..1.0,
            seed in any::<u64>(),
        ) {
            let policy = RetryPolicy {
                base_ms,
                factor,
                cap_ms,
                jitter_ratio: jitter.min((factor - 1.0) * 0.9),
            };
            prop_assume!(policy.validate().is_ok());

            let mut rng = StdRng::seed_from_u64(seed);
            let mut previous = Duration::ZERO;
            for attempts in 0..24 {
                let delay = policy.jittered(attempts, &mut rng);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(cap_ms));
                previous = delay;
            }
        }
    }
}
