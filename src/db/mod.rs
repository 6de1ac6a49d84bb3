//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into those models.
//!
//! External modules should import from `postline::db` — we re-export the
//! repository API and commonly used models for convenience.

pub mod model;
pub mod repo;

pub use model::{DuePost, NewChannel, NewPost, PostSummary, QueuedPostWithTimes, ScheduledPost};
pub use repo::*;
