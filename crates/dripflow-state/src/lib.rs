//! # Dripflow State
//!
//! Short-lived coordination state: claim markers, rate-limit
//! cooldowns, counters, recent activity logs. Never a source of
//! truth; everything here is reconcilable from the durable store.
//!
//! The [`SharedState`] trait is the seam: the bundled [`MemoryState`]
//! covers a single dispatcher instance; multi-instance deployments
//! plug a networked implementation behind the same trait.

pub mod claims;
pub mod shared;

pub use claims::{ClaimService, ClaimToken};
pub use shared::{MemoryState, SharedState};
