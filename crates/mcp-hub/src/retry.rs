//! Exponential backoff for idempotent operations.
//!
//! Only listings and process spawns go through here. Tool execution is never
//! retried because a duplicate call may duplicate its side effects.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{terminal_shape, transient_shape, McpError, Result};
use crate::error::{INVALID_PARAMS, INVALID_REQUEST};

pub type RetryPredicate = Arc<dyn Fn(&McpError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the backoff.
    pub jitter: f64,
    retryable: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: 0.1,
            retryable: Arc::new(is_retryable),
        }
    }

    /// Policy for capability listings on a live session.
    pub fn listing() -> Self {
        Self::new(2, Duration::from_millis(250), Duration::from_secs(2))
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&McpError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &McpError) -> bool {
        (self.retryable)(error)
    }

    /// `base * 2^(attempt-1)` capped at `max_delay`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The backoff plus up to `jitter` of it at random.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return backoff;
        }
        let spread = rand::thread_rng().gen::<f64>() * self.jitter;
        backoff + backoff.mul_f64(spread)
    }
}

/// Default classification: validation, auth and protocol-shape errors are
/// terminal, network-shaped ones are worth another try.
pub fn is_retryable(error: &McpError) -> bool {
    match error {
        McpError::Timeout(_)
        | McpError::Connection(_)
        | McpError::Disconnected
        | McpError::SessionExpired(_) => true,
        McpError::Transport(message) => !terminal_shape(message),
        McpError::SpawnFailed { kind, .. } => kind.is_retryable(),
        McpError::JsonRpc { code, message } => {
            if *code == INVALID_PARAMS || *code == INVALID_REQUEST || terminal_shape(message) {
                false
            } else {
                transient_shape(message)
            }
        }
        McpError::Protocol(message) => !terminal_shape(message) && transient_shape(message),
        _ => false,
    }
}

/// Run `op` until it succeeds, fails terminally, or the budget runs out.
/// The last error is returned unchanged.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !policy.is_retryable(&e) => {
                debug!("{} failed with a terminal error: {}", label, e);
                return Err(e);
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!("{} failed after {} attempt(s): {}", label, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    "{} attempt {}/{} failed: {}; retrying in {:?}",
                    label, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
