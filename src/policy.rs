use std::future::Future;
use std::time::Duration;

/// Per-registration caching policy.
///
/// The durations fix an entry's lifetime at creation: `stale_after` is how
/// long a successful fetch counts as fresh, `retain_for` is how long an entry
/// with no subscribers survives before eviction. `enabled == false` turns
/// [`ensure_fresh`](crate::registry::QueryRegistry::ensure_fresh) into a
/// no-op that creates no entry, for queries whose inputs are not available
/// yet.
#[derive(Clone, Debug)]
pub struct QueryPolicy {
    pub stale_after: Duration,
    pub retain_for: Duration,
    pub retry: RetryPolicy,
    pub enabled: bool,
    /// Re-run the fetch on this cadence while the entry has subscribers.
    pub refresh_interval: Option<Duration>,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            retain_for: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            enabled: true,
            refresh_interval: None,
        }
    }
}

impl QueryPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// How many times a failing fetch is attempted and how long to wait between
/// attempts. Counts attempts only; wall-clock limits belong to the fetch
/// function itself.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(250),
                cap: Duration::from_secs(30),
            },
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    /// Drives `op` until it succeeds or the attempt budget is spent. The
    /// error side carries the number of attempts made along with the final
    /// error.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, (u32, E)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let budget = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= budget => return Err((attempt, error)),
                Err(_) => {
                    tracing::debug!(attempt, "fetch attempt failed, retrying");
                    if let Some(delay) = self.backoff.delay(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

/// Delay schedule between retry attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, clamped to `cap`.
    Exponential {
        base: Duration,
        cap: Duration,
    },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            Backoff::None => None,
            Backoff::Fixed(d) => Some(*d),
            Backoff::Exponential { base, cap } => {
                let shift = attempt.saturating_sub(1).min(16);
                Some(base.saturating_mul(1u32 << shift).min(*cap))
            }
        }
    }
}
