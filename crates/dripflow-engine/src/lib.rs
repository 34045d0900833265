//! # Dripflow Engine
//!
//! The scheduling core: the recurring campaign clock, per-bot
//! throttling, sequence advancement, enrollment, broadcast execution
//! and the poller/dispatcher tick that drives them all.

pub mod advance;
pub mod broadcast;
pub mod clock;
pub mod enroll;
pub mod poller;
pub mod service;
pub mod throttle;

#[cfg(test)]
pub(crate) mod testutil;

pub use advance::{AdvanceOutcome, SequenceAdvancer};
pub use broadcast::BroadcastRunner;
pub use enroll::Enroller;
pub use poller::{Dispatcher, TickReport, spawn_dispatcher, spawn_enrollment_sweep};
pub use service::{CampaignService, ProgressSummary};
pub use throttle::ThrottleController;
