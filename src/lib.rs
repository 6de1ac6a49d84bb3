//! Slot-based scheduling and reconciliation for social-media posts.
//!
//! Channels publish on fixed time-of-day slots in their owner's timezone.
//! The library finds free slots, detects schedule anomalies (duplicate
//! minutes, stale slots, missed posts, lost delivery jobs) and repairs them,
//! keeping the delivery queue consistent with the database throughout.

pub mod admin;
pub mod clock;
pub mod config;
pub mod db;
pub mod detector;
pub mod finder;
pub mod model;
pub mod notify;
pub mod queue;
pub mod reconciler;
pub mod slots;
pub mod sweeps;
