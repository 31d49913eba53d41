//! Delayed-retry scheduling.
//!
//! The session retries failed or dropped room joins after a delay that
//! grows linearly with the historical attempt count, clamped at
//! [`RetryPolicy::max_attempt`]. The scheduler is a pure delay mechanism:
//! it never inspects the retried action's outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// How retry delays scale with the attempt count.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay per attempt; total delay is `base * min(attempt, max_attempt)`.
    pub base: Duration,
    /// Attempt count clamp, bounding backoff growth.
    pub max_attempt: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_attempt: 15,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry for the given attempt count.
    ///
    /// Monotonically non-decreasing in `attempt`; `attempt` is never treated
    /// as larger than [`max_attempt`](RetryPolicy::max_attempt).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base * attempt.min(self.max_attempt)
    }
}

/// Fires retry actions after a policy-derived delay.
///
/// Every [`schedule`](BackoffScheduler::schedule) call spawns its own
/// independent timer; scheduling under an existing key does not cancel the
/// previously pending retry — both fire. The latest task handle is retained
/// per key so a caller that wants to cancel a pending retry can.
pub struct BackoffScheduler {
    policy: RetryPolicy,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BackoffScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The policy this scheduler derives delays from.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `action` after the delay for `attempt`.
    ///
    /// Returns immediately; the action runs on its own task.
    pub fn schedule<F>(&self, key: &str, attempt: u32, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.policy.delay_for(attempt);
        debug!(key, attempt, ?delay, "retry scheduled");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(key.to_string(), handle);
        }
    }

    /// Abort the most recently scheduled retry for `key`, if still pending.
    ///
    /// Retries scheduled under the same key before the aborted one are
    /// unaffected.
    pub fn cancel(&self, key: &str) {
        if let Ok(mut pending) = self.pending.lock()
            && let Some(handle) = pending.remove(key)
        {
            handle.abort();
        }
    }
}
