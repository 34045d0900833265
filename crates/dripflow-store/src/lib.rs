//! # Dripflow Store
//!
//! SQLite-backed durable store — the source of truth for campaigns,
//! per-lead sequence progress, one-shot delivery jobs, leads, flows
//! and bots. Survives restarts; everything in `dripflow-state` is
//! reconcilable from here.
//!
//! Status transitions on jobs and campaigns are conditional updates
//! (`UPDATE ... WHERE status = ?`) so a double transition loses even
//! if two pollers briefly both believe they hold a claim.

pub mod store;

pub use store::Store;
