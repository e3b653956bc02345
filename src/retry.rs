use std::{fmt, sync::Arc, time::Duration};

use rand::Rng;

use crate::StatError;

/// Callback invoked before each retry sleep with `(attempt, delay, error)`.
///
/// `attempt` is the 0-based index of the attempt that just failed.
pub type RetryObserver = Arc<dyn Fn(u32, Duration, &StatError) + Send + Sync>;

/// Backoff schedule and retry eligibility.
///
/// The policy only computes durations; the executor does the waiting.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Scales each delay by a uniform factor in `[0.5, 1.5)`.
    pub jitter: bool,
    /// Statuses that are re-issued after a delay.
    pub retry_on_status: Vec<u16>,
    /// Optional observer for retries.
    pub on_retry: Option<RetryObserver>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("retry_on_status", &self.retry_on_status)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            retry_on_status: vec![429, 500, 502, 503, 504],
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on_status(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.retry_on_status = statuses.into();
        self
    }

    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, Duration, &StatError) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Delay before retrying after the 0-based `attempt` failed.
    ///
    /// `min(base_delay * multiplier^attempt, max_delay)`, then jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.clamp(0.0, self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };

        let seconds = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            capped
        };

        Duration::try_from_secs_f64(seconds).unwrap_or(self.max_delay)
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    pub(crate) fn notify(&self, attempt: u32, delay: Duration, err: &StatError) {
        if let Some(observer) = &self.on_retry {
            observer(attempt, delay, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::RetryPolicy;
    use crate::StatError;

    fn deterministic() -> RetryPolicy {
        RetryPolicy::default()
            .with_backoff(Duration::from_secs(1), Duration::from_secs(60), 2.0)
            .with_jitter(false)
    }

    #[test]
    fn delay_without_jitter_is_exponential() {
        let policy = deterministic();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(32));
    }

    #[test]
    fn delay_is_capped_and_non_decreasing() {
        let policy = deterministic();
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous, "attempt {attempt} went backwards");
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_secs(10), 2.0)
            .with_jitter(true);
        for _ in 0..500 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn default_retryable_statuses() {
        let policy = RetryPolicy::default();
        for status in [429, 500, 502, 503, 504] {
            assert!(policy.should_retry_status(status));
        }
        for status in [400, 401, 403, 404, 501] {
            assert!(!policy.should_retry_status(status));
        }
    }

    #[test]
    fn observer_receives_attempt_and_delay() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let policy = deterministic().on_retry(move |attempt, delay, _err| {
            sink.lock()
                .expect("observer mutex must not be poisoned")
                .push((attempt, delay));
        });

        let err = StatError::Decode("x".to_owned());
        policy.notify(0, policy.delay(0), &err);
        policy.notify(1, policy.delay(1), &err);

        let seen = seen.lock().expect("observer mutex must not be poisoned");
        assert_eq!(
            *seen,
            vec![(0, Duration::from_secs(1)), (1, Duration::from_secs(2))]
        );
    }

    #[test]
    fn debug_hides_callback() {
        let policy = RetryPolicy::none().on_retry(|_, _, _| {});
        let debug = format!("{policy:?}");
        assert!(debug.contains("<callback>"));
        assert!(debug.contains("max_retries: 0"));
    }
}
