//! Claim/lock service — time-bounded exclusive markers that keep
//! concurrent pollers from dispatching the same unit of work twice.
//!
//! A claim is a set-if-absent key holding a random token; release is
//! compare-and-delete so a claim that expired and was re-acquired by
//! someone else is never released by the old owner.

use std::sync::Arc;
use std::time::Duration;

use dripflow_core::Result;

use crate::shared::SharedState;

const CLAIM_PREFIX: &str = "claim:";

/// Proof of ownership for one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken(String);

impl ClaimToken {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Claim service over the shared state.
#[derive(Clone)]
pub struct ClaimService {
    state: Arc<dyn SharedState>,
}

impl ClaimService {
    pub fn new(state: Arc<dyn SharedState>) -> Self {
        Self { state }
    }

    /// Claim key for one sequence step of one progress record.
    pub fn sequence_key(progress_id: &str, step_index: i32) -> String {
        format!("seq:{progress_id}:{step_index}")
    }

    /// Claim key for a one-shot delivery job.
    pub fn job_key(job_id: &str) -> String {
        format!("job:{job_id}")
    }

    /// Claim key guarding a whole broadcast campaign execution.
    pub fn campaign_key(campaign_id: &str) -> String {
        format!("campaign:{campaign_id}")
    }

    /// Try to claim a unit of work. Returns None when someone else
    /// holds it.
    pub async fn try_claim(&self, key: &str, ttl: Duration) -> Result<Option<ClaimToken>> {
        let token = ClaimToken::new();
        let full = format!("{CLAIM_PREFIX}{key}");
        if self.state.set_nx(&full, token.as_str(), ttl).await? {
            tracing::debug!("claimed {key}");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    /// Release a claim we own. Returns false when the claim expired
    /// and was taken over (in which case nothing is deleted).
    pub async fn release(&self, key: &str, token: &ClaimToken) -> Result<bool> {
        let full = format!("{CLAIM_PREFIX}{key}");
        let released = self.state.compare_and_delete(&full, token.as_str()).await?;
        if !released {
            tracing::warn!("claim {key} no longer ours at release time");
        }
        Ok(released)
    }

    /// Extend the TTL of a claim we still own.
    pub async fn extend(&self, key: &str, token: &ClaimToken, ttl: Duration) -> Result<bool> {
        let full = format!("{CLAIM_PREFIX}{key}");
        match self.state.get(&full).await? {
            Some(current) if current == token.as_str() => self.state.expire(&full, ttl).await,
            _ => Ok(false),
        }
    }

    /// Whether anyone currently holds this claim.
    pub async fn is_claimed(&self, key: &str) -> Result<bool> {
        let full = format!("{CLAIM_PREFIX}{key}");
        Ok(self.state.get(&full).await?.is_some())
    }
}
