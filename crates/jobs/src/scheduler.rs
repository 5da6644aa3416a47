//! Cron-driven cleanup scheduler, guarded by a Redis lock so only one
//! instance runs a given tick.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cleanup::{run_cleanup, CleanupConfig, CleanupContext, CleanupReport};

const CLEANUP_LOCK_NAME: &str = "cleanup";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Redis error: {0}")]
    RedisError(String),
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),
}

impl SchedulerError {
    pub fn status_code(&self) -> u16 {
        match self {
            SchedulerError::InvalidCron(_) => 400,
            _ => 500,
        }
    }
}

/// Parse a cron expression and get the next run time after `after`
pub fn next_run_from_cron(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    let schedule = Schedule::from_str(cron_expr)
        .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;

    schedule
        .after(&after)
        .next()
        .ok_or_else(|| SchedulerError::InvalidCron("No upcoming execution time".to_string()))
}

/// Validate a cron expression
pub fn validate_cron(cron_expr: &str) -> Result<(), SchedulerError> {
    Schedule::from_str(cron_expr)
        .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;
    Ok(())
}

pub struct Scheduler {
    ctx: CleanupContext,
    config: CleanupConfig,
    holder: String,
    running: Arc<RwLock<bool>>,
}

impl Scheduler {
    pub fn new(ctx: CleanupContext, config: CleanupConfig) -> Result<Self, SchedulerError> {
        validate_cron(&config.cron)?;
        Ok(Self {
            ctx,
            config,
            holder: Uuid::new_v4().to_string(),
            running: Arc::new(RwLock::new(false)),
        })
    }

    /// Start the scheduler loop
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            tracing::warn!("Scheduler already running");
            return;
        }
        *running = true;
        drop(running);

        tracing::info!(cron = %self.config.cron, "Starting cleanup scheduler");

        loop {
            let next = match next_run_from_cron(&self.config.cron, Utc::now()) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!("Scheduler stopped: {}", e);
                    break;
                }
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            {
                let running = self.running.read().await;
                if !*running {
                    break;
                }
            }

            match self.run_once().await {
                Ok(Some(_)) => {}
                Ok(None) => tracing::debug!("Cleanup skipped, another instance holds the lock"),
                Err(e) => tracing::error!("Cleanup run failed: {}", e),
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Stop the scheduler after the current wait
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// Run one cleanup pass if the distributed lock can be taken.
    /// `Ok(None)` means another instance is already running it.
    pub async fn run_once(&self) -> Result<Option<CleanupReport>, SchedulerError> {
        if !self.acquire_lock().await? {
            return Ok(None);
        }

        let result = run_cleanup(&self.ctx, &self.config).await;

        if let Err(e) = self.release_lock().await {
            tracing::warn!("Failed to release cleanup lock: {}", e);
        }

        result.map(Some)
    }

    /// Without Redis there is nothing to coordinate with, so the lock is
    /// always granted
    async fn acquire_lock(&self) -> Result<bool, SchedulerError> {
        let Some(cache) = &self.ctx.cache else {
            return Ok(true);
        };
        cache
            .try_lock(CLEANUP_LOCK_NAME, &self.holder, self.config.lock_ttl_secs)
            .await
            .map_err(|e| SchedulerError::RedisError(e.to_string()))
    }

    async fn release_lock(&self) -> Result<(), SchedulerError> {
        if let Some(cache) = &self.ctx.cache {
            cache
                .release_lock(CLEANUP_LOCK_NAME, &self.holder)
                .await
                .map_err(|e| SchedulerError::RedisError(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_five_minutes() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 30).unwrap();
        let next = next_run_from_cron("0 */5 * * * *", at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap());

        let next = next_run_from_cron("0 */5 * * * *", next).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 10, 10, 0).unwrap());
    }

    #[test]
    fn rejects_bad_expressions() {
        assert!(matches!(validate_cron("every five minutes"), Err(SchedulerError::InvalidCron(_))));
        assert_eq!(SchedulerError::InvalidCron(String::new()).status_code(), 400);
        assert!(validate_cron("0 0 3 * * *").is_ok());
    }
}
