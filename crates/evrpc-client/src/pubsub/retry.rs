use anyhow::Result;
use rand::Rng as _;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How long to wait before the next attempt
#[derive(Debug, Clone, PartialEq)]
pub enum WaitStrategy {
    /// Same delay before every attempt
    Fixed(Duration),

    /// `min * multiplier^(attempt - 1)`, capped at `max`
    Exponential {
        min: Duration,
        max: Duration,
        multiplier: f64,
    },

    /// Uniformly random in `[0, min(max, multiplier * 2^(attempt - 1))]`
    RandomExponential { multiplier: Duration, max: Duration },
}

impl WaitStrategy {
    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        match *self {
            Self::Fixed(interval) => interval,
            Self::Exponential {
                min,
                max,
                multiplier,
            } => {
                let secs = min.as_secs_f64() * multiplier.powi(exponent.min(i32::MAX as u32) as i32);
                Duration::try_from_secs_f64(secs)
                    .unwrap_or(max)
                    .clamp(Duration::ZERO, max)
            }
            Self::RandomExponential { multiplier, max } => {
                let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
                let ceiling = multiplier.saturating_mul(factor).min(max);
                rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
            }
        }
    }

    /// Largest delay this strategy can produce
    pub fn max_delay(&self) -> Duration {
        match *self {
            Self::Fixed(interval) => interval,
            Self::Exponential { max, .. } | Self::RandomExponential { max, .. } => max,
        }
    }
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::RandomExponential {
            multiplier: Duration::from_secs(1),
            max: Duration::from_secs(45),
        }
    }
}

/// Wait strategy plus an optional attempt ceiling
///
/// The default retries forever with randomized exponential backoff capped at 45 seconds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetryPolicy {
    wait: WaitStrategy,

    /// None means unlimited retries
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(wait: WaitStrategy) -> Self {
        Self {
            wait,
            max_attempts: None,
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self::new(WaitStrategy::Fixed(interval))
    }

    pub fn exponential(min: Duration, max: Duration, multiplier: f64) -> Self {
        Self::new(WaitStrategy::Exponential {
            min,
            max,
            multiplier,
        })
    }

    pub fn random_exponential(multiplier: Duration, max: Duration) -> Self {
        Self::new(WaitStrategy::RandomExponential { multiplier, max })
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn wait(&self) -> &WaitStrategy {
        &self.wait
    }

    pub fn attempt_limit(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// Retry behaviour shared by the first connection attempt and every reconnect
#[derive(Debug, Clone, PartialEq)]
pub enum RetryConfig {
    /// Run once and hand the fault straight back
    Disabled,
    Policy(RetryPolicy),
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::Policy(RetryPolicy::default())
    }
}

impl From<RetryPolicy> for RetryConfig {
    fn from(policy: RetryPolicy) -> Self {
        Self::Policy(policy)
    }
}

/// Run `op` under `config`
///
/// With [`RetryConfig::Disabled`] this is a single call to `op`. Otherwise every
/// failure is logged and followed by a non-blocking sleep, then `op` runs again
/// until it succeeds or the attempt ceiling is reached, in which case the last
/// fault is returned.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = match config {
        RetryConfig::Disabled => return op().await,
        RetryConfig::Policy(policy) => policy,
    };

    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    log::info!("Succeeded after {attempt} attempts");
                }
                return Ok(value);
            }
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    log::error!("Giving up after {attempt} attempts: {e}");
                    return Err(e.context(format!("gave up after {attempt} attempts")));
                }

                let delay = policy.wait.delay(attempt);
                log::warn!("Attempt #{attempt} failed: {e}");
                log::debug!("Waiting {delay:?} before next attempt");
                sleep(delay).await;
            }
        }
    }
}
