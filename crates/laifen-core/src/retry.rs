//! Retry logic for BLE operations.
//!
//! Every retry loop on a toothbrush link is bounded and cancellable: a device
//! that stays unreachable after a batch is classified asleep by the caller,
//! and a shutdown interrupts the batch between attempts.
//!
//! # Example
//!
//! ```
//! use laifen_core::{RetryConfig, with_retry, Error};
//!
//! # async fn example() -> Result<(), Error> {
//! let config = RetryConfig::for_subscribe();
//!
//! let result = with_retry(&config, "subscribe", || async {
//!     Ok::<_, Error>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 means a single attempt).
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries (for exponential backoff).
    pub max_delay: Duration,
    /// Backoff multiplier (1.0 = constant delay, 2.0 = double each time).
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// No retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Fixed-interval retries: `attempts` tries, `interval` apart, no jitter.
    ///
    /// `attempts` of zero is treated as one.
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Connection batch: 10 attempts, 5 seconds apart.
    ///
    /// A waking toothbrush takes a few seconds before it accepts a
    /// connection, so attempts are spaced evenly rather than backed off.
    pub fn for_connect() -> Self {
        Self::fixed(10, Duration::from_secs(5))
    }

    /// Reconnect batch used by a poll that finds the link down: 5 attempts.
    pub fn for_reconnect() -> Self {
        Self::fixed(5, Duration::from_secs(1))
    }

    /// Notification subscription: 5 attempts, 1 second apart.
    pub fn for_subscribe() -> Self {
        Self::fixed(5, Duration::from_secs(1))
    }

    /// Empty characteristic reads: 2 extra reads, 2 seconds apart.
    pub fn for_read() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }

    /// Total number of attempts this config allows.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    // ==================== Builder Methods ====================

    /// Set maximum number of retries.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Calculate delay for a given attempt number.
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            // Up to 25% extra
            let jitter_factor = 1.0 + (rand::rng().random::<f64>() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Execute an async operation with retry logic.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once every attempt has failed.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_cancellable(config, operation_name, &CancellationToken::new(), operation).await
}

/// Like [`with_retry`], but stops with [`Error::Cancelled`] as soon as
/// `cancel` fires, including while sleeping between attempts.
pub async fn with_retry_cancellable<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }

                if attempt < config.max_retries {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation_name,
                        attempt + 1,
                        config.attempts(),
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }

                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(Error::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionFailureReason;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::connection_failed(None, ConnectionFailureReason::OutOfRange)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert!(config.jitter);
    }

    #[test]
    fn test_fixed_presets() {
        let connect = RetryConfig::for_connect();
        assert_eq!(connect.attempts(), 10);
        assert!(!connect.jitter);
        assert_eq!(connect.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(connect.delay_for_attempt(8), Duration::from_secs(5));

        assert_eq!(RetryConfig::for_subscribe().attempts(), 5);
        assert_eq!(RetryConfig::for_reconnect().attempts(), 5);
        assert_eq!(RetryConfig::fixed(0, Duration::ZERO).attempts(), 1);
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: false,
            max_retries: 5,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_with_retry_immediate_success() {
        let config = RetryConfig::new(3);
        let result = with_retry(&config, "test", || async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_eventual_success() {
        let config = RetryConfig::fixed(4, Duration::from_secs(1));
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<i32> = with_retry(&config, "test", || {
            let attempts = Arc::clone(&attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_all_fail() {
        let config = RetryConfig::fixed(3, Duration::from_secs(5));
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<i32> = with_retry(&config, "test", || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_non_retryable_error() {
        let config = RetryConfig::new(3);
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<i32> = with_retry(&config, "test", || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::device_not_found("gone"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_sleep() {
        let config = RetryConfig::fixed(10, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<()> = with_retry_cancellable(&config, "test", &cancel, || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_operation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> =
            with_retry_cancellable(&RetryConfig::new(3), "test", &cancel, || async { Ok(()) })
                .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
