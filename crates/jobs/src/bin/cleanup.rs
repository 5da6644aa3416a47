//! One-shot cleanup run, for external schedulers (cron, k8s CronJob).

use clovadrop_core::config::{DatabaseConfig, StorageConfig};
use clovadrop_core::Cache;
use clovadrop_jobs::runtime::{connect_pool, connect_storage};
use clovadrop_jobs::{CleanupConfig, CleanupContext, Scheduler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let database = DatabaseConfig::from_env()?;
    let pool = connect_pool(&database).await?;
    let storage = connect_storage(&StorageConfig::from_env()).await?;

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let cache = match Cache::new(&redis_url).await {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!("Redis unavailable, running without lock: {}", e);
            None
        }
    };

    let ctx = CleanupContext {
        pool,
        storage,
        cache,
        hub: None,
        presence: None,
    };
    let scheduler = Scheduler::new(ctx, CleanupConfig::from_env())?;

    match scheduler.run_once().await? {
        Some(report) => {
            println!(
                "cleanup: scanned={} deleted={} failed={}",
                report.scanned, report.deleted, report.failed
            );
            if report.failed > 0 {
                std::process::exit(1);
            }
        }
        None => {
            println!("cleanup: skipped, another run holds the lock");
        }
    }

    Ok(())
}
