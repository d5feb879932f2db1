//! When backups run: cron evaluation and the polling scheduler.

pub mod cron;
pub mod scheduler;

pub use cron::{CronExpression, Schedule};
pub use scheduler::BackupScheduler;
