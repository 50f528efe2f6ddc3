//! Backup orchestration for the keypoint extraction system.
//!
//! Exports the relational keypoints table and the image document store,
//! bundles them into a dated ZIP archive, delivers the archive by email, and
//! prunes expired artifacts, either on a cron schedule or on demand.

pub mod backup;
pub mod config;
pub mod errors;
pub mod notify;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod utils;

pub use config::Config;
pub use errors::{BackupError, Result};
pub use service::{BackupService, TriggerOutcome, scheduled_jobs};
