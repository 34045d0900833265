//! Throttle controller — per-bot minute-window budgets, fixed
//! inter-message pacing, provider cooldowns and retry backoff.
//!
//! Counters and cooldowns live in the fast shared state so every
//! poller sees the same picture.

use std::sync::Arc;
use std::time::Duration;

use dripflow_core::{Result, RetryConfig, Throttling};
use dripflow_state::SharedState;

const WINDOW: Duration = Duration::from_secs(60);
const ATTEMPT_TTL: Duration = Duration::from_secs(3600);

/// Per-bot send gating.
#[derive(Clone)]
pub struct ThrottleController {
    state: Arc<dyn SharedState>,
    retry: RetryConfig,
}

impl ThrottleController {
    pub fn new(state: Arc<dyn SharedState>, retry: RetryConfig) -> Self {
        Self { state, retry }
    }

    /// Whether the bot is inside a provider-issued cooldown window.
    pub async fn cooling_down(&self, bot_id: &str) -> Result<bool> {
        Ok(self.state.get(&cooldown_key(bot_id)).await?.is_some())
    }

    /// Put the bot in a cooldown after a rate-limit signal.
    pub async fn start_cooldown(&self, bot_id: &str, retry_after_secs: u64) -> Result<()> {
        tracing::warn!("bot {bot_id} rate limited, cooling down {retry_after_secs}s");
        self.state
            .set(
                &cooldown_key(bot_id),
                &retry_after_secs.to_string(),
                Duration::from_secs(retry_after_secs),
            )
            .await
    }

    /// Whether the bot has send budget left in its minute window.
    /// Returns false when the budget is spent or the bot is cooling
    /// down; the caller leaves the work pending for a later tick.
    /// Reserves nothing: the window is only charged by
    /// `consume_slot` once a message actually goes out, so claim
    /// contention and bookkeeping-only transitions cost no budget.
    pub async fn has_budget(&self, bot_id: &str, throttling: &Throttling) -> Result<bool> {
        if self.cooling_down(bot_id).await? {
            return Ok(false);
        }
        let used = self
            .state
            .get(&window_key(bot_id))
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(used < throttling.messages_per_minute as i64)
    }

    /// Charge one delivered message against the bot's minute window.
    pub async fn consume_slot(&self, bot_id: &str) -> Result<()> {
        self.state.incr(&window_key(bot_id), WINDOW).await?;
        Ok(())
    }

    /// Fixed delay between consecutive sends on the same bot.
    pub async fn pace(&self, throttling: &Throttling) {
        if throttling.delay_between_messages > 0 {
            tokio::time::sleep(Duration::from_secs(
                throttling.delay_between_messages as u64,
            ))
            .await;
        }
    }

    /// Count one more delivery attempt for a unit of work. Returns
    /// the attempt number.
    pub async fn record_attempt(&self, unit_key: &str) -> Result<u32> {
        let n = self.state.incr(&attempt_key(unit_key), ATTEMPT_TTL).await?;
        Ok(n as u32)
    }

    /// Clear the attempt counter once the unit succeeds or goes
    /// terminal.
    pub async fn clear_attempts(&self, unit_key: &str) -> Result<()> {
        self.state.delete(&attempt_key(unit_key)).await
    }

    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.retry.max_attempts
    }

    /// Exponential backoff: initial * 2^(attempts-1).
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u64 << attempts.saturating_sub(1).min(16);
        Duration::from_secs(self.retry.initial_backoff_secs * factor)
    }
}

fn window_key(bot_id: &str) -> String {
    format!("throttle:{bot_id}")
}

fn cooldown_key(bot_id: &str) -> String {
    format!("cooldown:{bot_id}")
}

fn attempt_key(unit_key: &str) -> String {
    format!("attempts:{unit_key}")
}
