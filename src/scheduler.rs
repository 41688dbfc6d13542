use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    delay::{DelayStrategy, ExponentialJitter},
    CallError, CallResponse, Result,
};

/// Owns the service-wide retry defaults and performs backoff waits.
#[derive(Clone)]
pub struct RetryScheduler {
    default_max_retries: u32,
    default_max_delay: Duration,
    strategy: Arc<dyn DelayStrategy>,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("default_max_retries", &self.default_max_retries)
            .field("default_max_delay", &self.default_max_delay)
            .finish_non_exhaustive()
    }
}

impl RetryScheduler {
    pub fn new(default_max_retries: u32, default_max_delay: Duration) -> Self {
        Self {
            default_max_retries,
            default_max_delay,
            strategy: Arc::new(ExponentialJitter::default()),
        }
    }

    /// Replaces the service-wide default strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn DelayStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    pub fn default_max_delay(&self) -> Duration {
        self.default_max_delay
    }

    /// Delay before retry number `attempt`, capped by the effective max delay.
    ///
    /// `strategy` and `max_delay` are per-classifier overrides.
    pub fn delay_for(
        &self,
        attempt: u32,
        response: Option<&CallResponse>,
        strategy: Option<&Arc<dyn DelayStrategy>>,
        max_delay: Option<Duration>,
    ) -> Duration {
        let strategy = strategy.unwrap_or(&self.strategy);
        let computed = strategy.calculate(attempt.max(1), response);
        computed.min(max_delay.unwrap_or(self.default_max_delay))
    }

    /// Suspends for `delay`, failing with [`CallError::Cancelled`] as soon as
    /// `cancel` fires. A zero delay still yields to the runtime.
    pub async fn suspend(&self, delay: Duration, cancel: Option<&CancellationToken>) -> Result<()> {
        let wait = async {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
        };

        match cancel {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(CallError::Cancelled);
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(CallError::Cancelled),
                    _ = wait => Ok(()),
                }
            }
            None => {
                wait.await;
                Ok(())
            }
        }
    }
}
