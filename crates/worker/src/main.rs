//! Workbridge Background Worker
//!
//! Runs the daily key allocation job: grants monthly keys to pro
//! subscriptions whose next-allocation date falls today, independent of
//! webhook delivery.

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use workbridge_billing::{BillingService, NullNotifier};
use workbridge_shared::create_pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Workbridge Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    // The worker never publishes realtime events.
    let billing = Arc::new(BillingService::from_env(pool, Arc::new(NullNotifier))?);

    let scheduler = JobScheduler::new().await?;

    // Daily key allocation at midnight UTC. Monthly granularity makes the
    // exact time of day arbitrary; once a day is enough.
    let allocation_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 0 * * *", move |_uuid, _l| {
            let billing = allocation_billing.clone();
            Box::pin(async move {
                info!("Running daily key allocation job");
                match billing.allocation.run_once().await {
                    Ok(summary) => info!(
                        due = summary.due,
                        granted = summary.granted,
                        failed = summary.failed,
                        "Key allocation job complete"
                    ),
                    Err(e) => error!(error = %e, "Key allocation job failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Daily key allocation (midnight UTC)");

    // Heartbeat so a silent worker is distinguishable from a dead one.
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    // The scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
