//! Backoff delay strategies.
//!
//! A strategy maps `(retry number, failing response)` to a delay. The
//! scheduler caps whatever a strategy returns, so strategies do not need to
//! know about max-delay settings.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::CallResponse;

/// Base of the default exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Computes the delay before a retry.
///
/// `attempt` is 1 for the first retry (not the first physical attempt).
pub trait DelayStrategy: Send + Sync {
    fn calculate(&self, attempt: u32, response: Option<&CallResponse>) -> Duration;
}

/// Default strategy: honors `retry-after`, otherwise exponential backoff with
/// full jitter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExponentialJitter {
    pub base: Duration,
}

impl Default for ExponentialJitter {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
        }
    }
}

impl ExponentialJitter {
    /// Upper bound (exclusive) of the jittered delay for `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        Duration::from_millis(base_ms.saturating_mul(1_u64 << exp))
    }
}

impl DelayStrategy for ExponentialJitter {
    fn calculate(&self, attempt: u32, response: Option<&CallResponse>) -> Duration {
        if let Some(hint) = response.and_then(retry_after_hint) {
            return hint;
        }
        let ceiling_ms = self.ceiling(attempt).as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..ceiling_ms))
    }
}

/// Always returns the same delay.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FixedDelay(pub Duration);

impl DelayStrategy for FixedDelay {
    fn calculate(&self, _attempt: u32, _response: Option<&CallResponse>) -> Duration {
        self.0
    }
}

/// Strategy backed by a closure. Build it with [`delay_fn`].
#[derive(Clone, Copy, Debug)]
pub struct DelayFn<F>(F);

/// Wraps a closure as a [`DelayStrategy`].
pub fn delay_fn<F>(f: F) -> DelayFn<F>
where
    F: Fn(u32, Option<&CallResponse>) -> Duration + Send + Sync,
{
    DelayFn(f)
}

impl<F> DelayStrategy for DelayFn<F>
where
    F: Fn(u32, Option<&CallResponse>) -> Duration + Send + Sync,
{
    fn calculate(&self, attempt: u32, response: Option<&CallResponse>) -> Duration {
        (self.0)(attempt, response)
    }
}

/// Reads the `retry-after` header of `response`, if it parses.
pub fn retry_after_hint(response: &CallResponse) -> Option<Duration> {
    parse_retry_after(response.header("retry-after")?, Utc::now())
}

/// Parses a `retry-after` value relative to `now`.
///
/// Accepts delay-seconds (fractions allowed) or an absolute date in HTTP-date
/// (RFC 2822 / RFC 1123) or RFC 3339 form. Anything else is no hint.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<f64>() {
        if !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        return Some(Duration::from_millis((seconds * 1_000.0).round() as u64));
    }

    let deadline = DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()?
        .with_timezone(&Utc);
    let remaining = (deadline - now).num_milliseconds().max(0);
    Some(Duration::from_millis(remaining as u64))
}
