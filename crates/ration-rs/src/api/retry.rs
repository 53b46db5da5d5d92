//! Opt-in retry for model calls.
//!
//! A failed or empty model response ends the run by default
//! (`max_retries = 0`). With retries enabled, the loop backs off
//! exponentially and retries only failures [`classify`] calls transient.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy for model calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first failure. 0 fails immediately.
    pub max_retries: u32,
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that may be shaved off, in `0.0..=1.0`.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter_ratio: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed), capped at
    /// `max_delay`. Jitter is a fixed function of `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let spread = f64::from(attempt.wrapping_mul(2_654_435_761) % 1_000) / 1_000.0;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        Duration::from_secs_f64(capped * (1.0 - ratio * spread))
    }
}

// ── Failure classification ─────────────────────────────────────────

/// How a provider error string should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Rate limits, 5xx, dropped connections and timeouts.
    Transient,
    /// Other 4xx responses: the same request will fail again.
    Permanent,
    Unknown,
}

/// Classify a provider error. An `HTTP <status>` code wins over keywords.
pub fn classify(error: &str) -> FailureClass {
    if let Some(status) = http_status(error) {
        return match status {
            408 | 429 | 500..=599 => FailureClass::Transient,
            400..=499 => FailureClass::Permanent,
            _ => FailureClass::Unknown,
        };
    }
    let lower = error.to_lowercase();
    if ["timed out", "timeout", "connection", "overloaded", "rate limit"]
        .iter()
        .any(|p| lower.contains(p))
    {
        FailureClass::Transient
    } else {
        FailureClass::Unknown
    }
}

fn http_status(error: &str) -> Option<u16> {
    let (_, rest) = error.split_once("HTTP ")?;
    rest.get(..3)?.parse().ok()
}

/// Serialize a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
