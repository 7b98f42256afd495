//! Delay between consecutive failed plays.
//!
//! A transcoder that cannot start (or dies straight away because the ingest
//! is unreachable) would otherwise be respawned in a tight loop. The delay
//! for the `n`-th consecutive failure (0-indexed) is `first × factor^n`,
//! capped at `max`, with ±10% jitter so several engines pointed at the same
//! ingest don't retry in lockstep.

use std::time::Duration;

use crate::config::BackoffConfig;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(cfg: &BackoffConfig) -> Self {
        Self {
            first: Duration::from_millis(cfg.first_ms),
            max: Duration::from_millis(cfg.max_ms.max(cfg.first_ms)),
            factor: if cfg.factor.is_finite() && cfg.factor >= 1.0 { cfg.factor } else { 1.0 },
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        if !self.jitter {
            return base;
        }
        let spread = 0.9 + fastrand::f64() * 0.2;
        base.mul_f64(spread).min(self.max)
    }
}
