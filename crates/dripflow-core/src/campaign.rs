//! Campaign definitions. Broadcast and sequence campaigns share one
//! lifecycle and one dispatch pipeline; the variant-specific parts
//! live behind [`CampaignKind`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DripflowError, Result};
use crate::types::new_id;

/// Campaign lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
            CampaignStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scheduled" => CampaignStatus::Scheduled,
            "running" => CampaignStatus::Running,
            "paused" => CampaignStatus::Paused,
            "completed" => CampaignStatus::Completed,
            "cancelled" => CampaignStatus::Cancelled,
            "error" => CampaignStatus::Error,
            _ => CampaignStatus::Draft,
        }
    }
}

/// How often a broadcast campaign fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Once,
    Daily,
    Weekly,
}

/// Broadcast schedule definition. `days_of_week` uses 0 = Sunday
/// through 6 = Saturday; `time_of_day` is "HH:MM" 24h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub kind: ScheduleKind,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_of_day: Option<String>,
    #[serde(default)]
    pub days_of_week: Vec<u32>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".into()
}

/// Units for sequence step offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Minutes,
    Hours,
    Days,
}

/// Delay between sequence steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeInterval {
    pub value: u32,
    pub unit: TimeUnit,
}

impl TimeInterval {
    /// Offset in whole minutes, for ordering checks.
    pub fn as_minutes(&self) -> u64 {
        let v = self.value as u64;
        match self.unit {
            TimeUnit::Minutes => v,
            TimeUnit::Hours => v * 60,
            TimeUnit::Days => v * 60 * 24,
        }
    }
}

/// One step of a sequence campaign: which flow to send and how long
/// after the previous step it becomes due.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub flow_id: String,
    pub interval: TimeInterval,
    /// "HH:MM" pin for the due time; only meaningful when the
    /// interval unit is days.
    #[serde(default)]
    pub time_of_day: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Which leads a campaign targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudienceFilter {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
    /// Only leads that interacted within the last N days.
    #[serde(default)]
    pub last_interaction_days: Option<u32>,
}

/// Per-bot send budget for one campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Throttling {
    #[serde(default = "default_mpm")]
    pub messages_per_minute: u32,
    /// Seconds between consecutive sends on the same bot.
    #[serde(default = "default_delay")]
    pub delay_between_messages: u32,
}

fn default_mpm() -> u32 {
    20
}
fn default_delay() -> u32 {
    1
}

impl Default for Throttling {
    fn default() -> Self {
        Self {
            messages_per_minute: default_mpm(),
            delay_between_messages: default_delay(),
        }
    }
}

/// Aggregated campaign counters. Run history and daily rollups are
/// stored relationally, not inline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CampaignStats {
    pub targeted: u64,
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub blocked: u64,
    pub leads_entered: u64,
    pub messages_sent: u64,
    pub flows_completed: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Outcome counters for a single broadcast run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub targeted: u64,
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub blocked: u64,
}

/// Variant-specific campaign payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CampaignKind {
    /// One flow to a filtered audience at scheduled times.
    Broadcast { flow_id: String, schedule: Schedule },
    /// Timed multi-step drip sequence per enrolled lead.
    Sequence { steps: Vec<SequenceStep> },
}

/// A campaign: one owner, one bot, one audience, one kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub user_id: String,
    pub bot_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub filter: AudienceFilter,
    #[serde(default)]
    pub throttling: Throttling,
    pub status: CampaignStatus,
    pub kind: CampaignKind,
    #[serde(default)]
    pub stats: CampaignStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn valid_time_of_day(s: &str) -> bool {
    parse_time_of_day(s).is_some()
}

/// Parse "HH:MM" into (hour, minute).
pub fn parse_time_of_day(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour < 24 && minute < 60 {
        Some((hour, minute))
    } else {
        None
    }
}

impl Campaign {
    pub fn new(user_id: &str, bot_id: &str, name: &str, kind: CampaignKind) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            user_id: user_id.to_string(),
            bot_id: bot_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            filter: AudienceFilter::default(),
            throttling: Throttling::default(),
            status: CampaignStatus::Draft,
            kind,
            stats: CampaignStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn sequence_steps(&self) -> Option<&[SequenceStep]> {
        match &self.kind {
            CampaignKind::Sequence { steps } => Some(steps),
            CampaignKind::Broadcast { .. } => None,
        }
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        match &self.kind {
            CampaignKind::Broadcast { schedule, .. } => Some(schedule),
            CampaignKind::Sequence { .. } => None,
        }
    }

    /// Validate the campaign definition before it is stored or
    /// activated.
    pub fn validate(&self) -> Result<()> {
        if self.throttling.messages_per_minute == 0 || self.throttling.messages_per_minute > 30 {
            return Err(DripflowError::InvalidCampaign(
                "messages_per_minute must be between 1 and 30".into(),
            ));
        }
        match &self.kind {
            CampaignKind::Broadcast { flow_id, schedule } => {
                if flow_id.is_empty() {
                    return Err(DripflowError::InvalidCampaign("missing flow".into()));
                }
                if let Some(tod) = &schedule.time_of_day
                    && !valid_time_of_day(tod)
                {
                    return Err(DripflowError::InvalidCampaign(format!(
                        "bad time_of_day '{tod}', expected HH:MM"
                    )));
                }
                if schedule.kind == ScheduleKind::Weekly {
                    if schedule.days_of_week.is_empty() {
                        return Err(DripflowError::InvalidCampaign(
                            "weekly schedule needs days_of_week".into(),
                        ));
                    }
                    if schedule.days_of_week.iter().any(|d| *d > 6) {
                        return Err(DripflowError::InvalidCampaign(
                            "days_of_week entries must be 0..=6".into(),
                        ));
                    }
                }
            }
            CampaignKind::Sequence { steps } => {
                if steps.is_empty() {
                    return Err(DripflowError::InvalidCampaign("empty step list".into()));
                }
                for (i, step) in steps.iter().enumerate() {
                    if step.flow_id.is_empty() {
                        return Err(DripflowError::InvalidCampaign(format!(
                            "step {i} has no flow"
                        )));
                    }
                    if step.time_of_day.is_some() && step.interval.unit != TimeUnit::Days {
                        return Err(DripflowError::InvalidCampaign(format!(
                            "step {i}: time_of_day only applies to day intervals"
                        )));
                    }
                    if let Some(tod) = &step.time_of_day
                        && !valid_time_of_day(tod)
                    {
                        return Err(DripflowError::InvalidCampaign(format!(
                            "step {i}: bad time_of_day '{tod}', expected HH:MM"
                        )));
                    }
                    // Cumulative offsets must strictly increase past step 0.
                    if i > 0 && step.interval.as_minutes() == 0 {
                        return Err(DripflowError::InvalidCampaign(format!(
                            "step {i} has a zero interval"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
