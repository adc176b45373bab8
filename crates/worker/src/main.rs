//! Sekolah Background Worker
//!
//! Handles scheduled billing maintenance:
//! - Trial conversion sweep (daily at 1:00 UTC)
//! - Subscription expiry warnings (daily at 2:00 UTC)
//! - Expired subscription handling (daily at 2:30 UTC)
//! - Stale payment transaction expiry (hourly)
//! - Billing invariant checks (daily at 3:00 UTC)

use std::sync::Arc;
use std::time::Duration;

use sekolah_billing::BillingService;
use sekolah_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Sekolah Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without a gateway the sweeps cannot run; stay alive so the
            // deployment is visible rather than crash-looping.
            warn!(error = %e, "Billing service unavailable, idling without scheduled jobs");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker idle heartbeat");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Trial conversion sweep (daily at 1:00 UTC)
    let trial_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 1 * * *", move |_uuid, _l| {
            let billing = trial_billing.clone();
            Box::pin(async move {
                info!("Running trial conversion sweep");
                if let Err(e) = billing.maintenance.check_and_convert_trials().await {
                    error!(error = %e, "Trial conversion sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial conversion sweep (daily at 1:00 UTC)");

    // Job 2: Expiry warnings (daily at 2:00 UTC)
    let warning_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let billing = warning_billing.clone();
            Box::pin(async move {
                info!("Running subscription expiry warning sweep");
                if let Err(e) = billing.maintenance.check_and_send_warnings().await {
                    error!(error = %e, "Expiry warning sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiry warning sweep (daily at 2:00 UTC)");

    // Job 3: Expired subscription handling (daily at 2:30 UTC)
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 2 * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                info!("Running expired subscription sweep");
                if let Err(e) = billing
                    .maintenance
                    .check_and_handle_expired_subscriptions()
                    .await
                {
                    error!(error = %e, "Expired subscription sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expired subscription sweep (daily at 2:30 UTC)");

    // Job 4: Expire stale pending payment transactions (hourly)
    let stale_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let billing = stale_billing.clone();
            Box::pin(async move {
                match billing.payments.expire_stale_transactions().await {
                    Ok(expired) if expired > 0 => {
                        info!(expired, "Stale transaction sweep complete")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Stale transaction sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale transaction expiry (hourly)");

    // Job 5: Billing invariant checks (daily at 3:00 UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "All billing invariants hold"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 3:00 UTC)");

    // Job 6: Health check heartbeat (every 5 minutes)
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

    info!("Sekolah Worker started successfully with {} scheduled jobs", 6);

    // Keep the main task running; the scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
