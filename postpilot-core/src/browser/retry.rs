use std::time::Duration;

use futures::future::LocalBoxFuture;
use tokio::time::sleep;
use tracing::debug;

use super::error::BrowserResult;

/// Fixed-backoff retry for a single interaction that may not be ready yet,
/// such as a publish button still hydrating.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Runs `operation` against `target` until it succeeds or the attempts
    /// run out, returning the last error.
    pub async fn run<S, T, F>(
        &self,
        label: &str,
        target: &mut S,
        mut operation: F,
    ) -> BrowserResult<RetryOutcome<T>>
    where
        S: ?Sized,
        F: for<'s> FnMut(&'s mut S, usize) -> LocalBoxFuture<'s, BrowserResult<T>>,
    {
        let mut attempt = 0usize;
        loop {
            match operation(&mut *target, attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt + 1,
                    });
                }
                Err(error) => {
                    attempt += 1;
                    debug!(
                        step = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "attempt failed"
                    );
                    if attempt >= self.max_attempts {
                        return Err(error);
                    }
                    if !self.backoff.is_zero() {
                        sleep(self.backoff).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::error::BrowserError;

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        let mut calls = 0usize;
        let started = tokio::time::Instant::now();
        let outcome = policy
            .run("publish_open", &mut calls, |calls, _| {
                Box::pin(async move {
                    *calls += 1;
                    if *calls < 3 {
                        Err(BrowserError::NotFound("css:.publish_btn".into()))
                    } else {
                        Ok("clicked")
                    }
                })
            })
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result, "clicked");
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(500));
        let mut calls = 0usize;
        let result = policy
            .run("publish_open", &mut calls, |calls, _| {
                Box::pin(async move {
                    *calls += 1;
                    Err::<(), _>(BrowserError::Timeout("publish button".into()))
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }
}
