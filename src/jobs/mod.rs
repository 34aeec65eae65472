//! In-process periodic workers. Both call the same service operations as the
//! job endpoints.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::auth::JobAccess;
use crate::config::JobsConfig;
use crate::handlers::AppServices;
use crate::services::payouts::PayoutRunRequest;

/// Spawns the sweep and payout workers when enabled. Returns their handles.
pub fn start_workers(services: AppServices, cfg: &JobsConfig) -> Vec<JoinHandle<()>> {
    if !cfg.enable_background_jobs {
        info!("Background jobs disabled");
        return Vec::new();
    }
    vec![
        spawn_fulfillment_sweep(
            services.clone(),
            Duration::from_secs(cfg.fulfillment_sweep_interval_secs),
            cfg.sweep_batch_size,
        ),
        spawn_payout_check(services, Duration::from_secs(cfg.payout_check_interval_secs)),
    ]
}

fn spawn_fulfillment_sweep(services: AppServices, every: Duration, batch_size: u64) -> JoinHandle<()> {
    info!(interval_secs = every.as_secs(), "Starting fulfillment sweep worker");
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = services.fulfillment.sweep(batch_size).await {
                error!(error = %e, "Fulfillment sweep failed");
            }
        }
    })
}

/// Runs the payout batch; off-schedule ticks end as skipped reports, and a
/// second tick on a payout day finds the day's batch already recorded.
fn spawn_payout_check(services: AppServices, every: Duration) -> JoinHandle<()> {
    info!(interval_secs = every.as_secs(), "Starting payout worker");
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match services
                .payouts
                .run_batch(PayoutRunRequest::default(), &JobAccess::JobToken, Utc::now())
                .await
            {
                Ok(report) if report.skipped => {
                    tracing::debug!(message = ?report.message, "Payout check skipped")
                }
                Ok(report) => info!(batch_number = ?report.batch_number, "Scheduled payout batch ran"),
                Err(e) => error!(error = %e, "Scheduled payout batch failed"),
            }
        }
    })
}
