//! # Dripflow Core
//!
//! Shared data model for the drip-sequence scheduling engine:
//! campaigns (broadcast and sequence variants behind one type),
//! per-lead sequence progress, one-shot delivery jobs, leads, flows
//! and bots, plus the crate-wide error type and TOML configuration.

pub mod campaign;
pub mod config;
pub mod error;
pub mod progress;
pub mod types;

pub use campaign::{
    AudienceFilter, Campaign, CampaignKind, CampaignStats, CampaignStatus, RunStats, Schedule,
    ScheduleKind, SequenceStep, Throttling, TimeInterval, TimeUnit, parse_time_of_day,
};
pub use config::{DispatcherConfig, DripflowConfig, RetryConfig, StoreConfig, TelegramConfig};
pub use error::{DripflowError, Result};
pub use progress::{JobStatus, ScheduledMessage, SequenceProgress, StepRecord};
pub use types::{Bot, Flow, Lead, MessagePart, PartButton, PartKind, new_id};
