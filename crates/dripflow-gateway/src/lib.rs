//! # Dripflow Gateway
//!
//! Outbound delivery. The dispatcher hands a rendered flow to a
//! [`DeliveryGateway`]; the gateway reports back a receipt or a
//! classified failure so the engine can decide between retrying,
//! cooling down a bot, or retiring the lead.

pub mod render;
pub mod telegram;

pub use telegram::TelegramGateway;

use async_trait::async_trait;
use thiserror::Error;

use dripflow_core::{Bot, Flow, Lead};

/// Why a delivery did not go through. The classification drives the
/// engine's reaction, so variants map to distinct recovery paths.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Provider asked us to slow down. The whole bot cools off.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The recipient is permanently gone (blocked, deactivated,
    /// chat deleted). Never retried.
    #[error("recipient unreachable: {reason}")]
    Unreachable { reason: String },

    /// Anything that might succeed on a later attempt.
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Unreachable { .. })
    }
}

/// What a successful delivery tells us.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReceipt {
    pub parts_sent: u32,
}

/// Sends a whole flow to one lead through one bot. Implementations
/// render templates per lead and honor per-part delays.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn send_flow(
        &self,
        bot: &Bot,
        lead: &Lead,
        flow: &Flow,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}
