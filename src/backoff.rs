//! Exponential backoff with additive jitter for reconnect attempts.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::BackoffConfig;

/// Backoff calculator.  Tracks the attempt counter for one connection mode.
#[derive(Debug)]
pub struct Backoff {
    cfg:     BackoffConfig,
    attempt: u32,
    rng:     StdRng,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, attempt: 0, rng: StdRng::from_entropy() }
    }

    /// Deterministic jitter sequence, for tests.
    pub fn with_seed(cfg: BackoffConfig, seed: u64) -> Self {
        Self { cfg, attempt: 0, rng: StdRng::seed_from_u64(seed) }
    }

    /// Delay without jitter: `min(max_delay, base_delay * multiplier^attempt)`.
    pub fn capped(&self, attempt: u32) -> Duration {
        let base_ms = self.cfg.base_delay.as_millis() as f64;
        let max_ms  = self.cfg.max_delay.as_millis() as f64;
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = base_ms * self.cfg.multiplier.powi(exp);
        let ms = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(ms as u64)
    }

    /// Delay for `attempt` including a jitter drawn from `[0, max_jitter]`.
    pub fn delay_for(&mut self, attempt: u32) -> Duration {
        let jitter_ms = self.cfg.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 { 0 } else { self.rng.gen_range(0..=jitter_ms) };
        self.capped(attempt) + Duration::from_millis(jitter)
    }

    /// Delay for the current attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let d = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        d
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
