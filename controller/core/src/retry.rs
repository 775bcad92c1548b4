//! A bounded-attempt, exponential-backoff retry executor.
//!
//! Kernel mutations (and the odd API write) can fail transiently; callers
//! wrap them in [`Retry::run`]. Errors implementing [`Recoverable`] can
//! declare themselves permanent to short-circuit the budget.

use std::future::Future;
use tokio::time;

/// Classifies errors for the executor. Anything not explicitly permanent is
/// retried until the attempt budget runs out.
pub trait Recoverable {
    fn is_permanent(&self) -> bool {
        false
    }
}

/// Retry policy: a fixed attempt budget with doubling backoff.
#[derive(Clone, Copy, Debug)]
pub struct Retry {
    pub attempts: u32,
    pub base_delay: time::Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: time::Duration::from_millis(150),
        }
    }
}

impl Retry {
    /// Runs `f` until it succeeds, returns a permanent error, or the attempt
    /// budget is exhausted; the last error is surfaced to the caller.
    pub async fn run<T, E, F, Fut>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Recoverable,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    if attempt >= self.attempts {
                        return Err(e);
                    }
                    time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}
