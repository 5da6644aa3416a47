//! Background jobs: expiry cleanup and its cron scheduler.

pub mod cleanup;
pub mod runtime;
pub mod scheduler;

pub use cleanup::{run_cleanup, CleanupConfig, CleanupContext, CleanupReport};
pub use scheduler::{Scheduler, SchedulerError};
