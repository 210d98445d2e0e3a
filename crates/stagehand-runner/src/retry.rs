use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// Bounded attempts with a fixed delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub sleep_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, sleep: Duration) -> Self {
        Self {
            max_attempts,
            sleep_ms: sleep.as_millis() as u64,
        }
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    pub description: String,
    pub attempts: u32,
    pub last_error: String,
}

impl std::fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} did not succeed after {} attempt(s): {}",
            self.description, self.attempts, self.last_error
        )
    }
}

/// Calls `attempt` until it returns `Ok`, sleeping between failures. The
/// closure gets the 1-based attempt number. Never sleeps after the last
/// attempt, and always makes at least one.
pub fn retry<T, F>(description: &str, policy: &RetryPolicy, mut attempt: F) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Result<T, String>,
{
    let max = policy.max_attempts.max(1);
    let mut last_error = String::new();
    for n in 1..=max {
        match attempt(n) {
            Ok(value) => {
                tracing::debug!(what = description, attempt = n, "succeeded");
                return Ok(value);
            }
            Err(e) => {
                tracing::warn!(what = description, attempt = n, max, error = %e, "attempt failed");
                last_error = e;
            }
        }
        if n < max {
            thread::sleep(policy.sleep());
        }
    }
    Err(RetryExhausted {
        description: description.to_string(),
        attempts: max,
        last_error,
    })
}
