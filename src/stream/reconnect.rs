//! Supervising reconnect policy for event streams
//!
//! Exponential backoff with full jitter, capped at `max_delay`. A server
//! `retry:` hint replaces the initial delay for subsequent attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_ms;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Full jitter when true: the actual delay is uniform in `[0, backoff]`.
    pub jitter: bool,
    /// `None` retries indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Whether another attempt is allowed after `attempt` consecutive failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Un-jittered delay before attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32, server_hint: Option<Duration>) -> Duration {
        let base = server_hint.unwrap_or(self.initial_delay).as_secs_f64();
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1).min(32) as i32);
        let secs = (base * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn delay(&self, attempt: u32, server_hint: Option<Duration>) -> Duration {
        let backoff = self.backoff(attempt, server_hint);
        if !self.jitter || backoff.is_zero() {
            return backoff;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        backoff.mul_f64(factor)
    }
}
