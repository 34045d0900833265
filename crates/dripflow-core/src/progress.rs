//! Per-lead sequence progress and one-shot delivery jobs: the
//! durable bookkeeping the dispatcher advances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::new_id;

/// One attempt at one sequence step, appended to the progress log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: i32,
    pub flow_id: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Where one lead stands in one sequence campaign. Unique per
/// (lead, campaign); mutated only by the advancement engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceProgress {
    pub id: String,
    pub lead_id: String,
    pub campaign_id: String,
    pub started_at: DateTime<Utc>,
    /// -1 means no step has completed yet.
    pub last_step_index: i32,
    pub last_step_sent_at: Option<DateTime<Utc>>,
    pub next_step_scheduled_for: Option<DateTime<Utc>>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SequenceProgress {
    pub fn new(lead_id: &str, campaign_id: &str, first_due: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            lead_id: lead_id.to_string(),
            campaign_id: campaign_id.to_string(),
            started_at: Utc::now(),
            last_step_index: -1,
            last_step_sent_at: None,
            next_step_scheduled_for: Some(first_due),
            is_completed: false,
            completed_at: None,
        }
    }
}

/// One-shot delivery job status. Terminal once sent, failed or
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => JobStatus::Processing,
            "sent" => JobStatus::Sent,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// A one-shot scheduled delivery: one flow to one lead at one time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: String,
    pub user_id: String,
    pub bot_id: String,
    pub lead_id: String,
    pub flow_id: String,
    pub campaign_id: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: JobStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Delivery attempts so far (rate-limit retries count).
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl ScheduledMessage {
    pub fn new(
        user_id: &str,
        bot_id: &str,
        lead_id: &str,
        flow_id: &str,
        campaign_id: &str,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            user_id: user_id.to_string(),
            bot_id: bot_id.to_string(),
            lead_id: lead_id.to_string(),
            flow_id: flow_id.to_string(),
            campaign_id: campaign_id.to_string(),
            scheduled_time,
            status: JobStatus::Pending,
            sent_at: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }
}
