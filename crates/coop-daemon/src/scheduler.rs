//! Background scheduler for the lifecycle and billing sweeps.
//!
//! Two loops: a daily lifecycle pass (expiry, suspension, reminders,
//! renewals) and an hourly failed-payment replay. Each pass runs under a
//! hard timeout so a wedged sweep cannot stall the loop forever, and a
//! slow pass is logged once it crosses the soft timeout.

use std::sync::Arc;

use chrono::Utc;
use coop_core::billing::PaymentCoordinator;
use coop_core::config::SchedulerConfig;
use coop_core::lifecycle::Lifecycle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Runs both sweep loops until the process exits.
pub async fn run(
    lifecycle: Arc<Lifecycle>,
    billing: Arc<PaymentCoordinator>,
    config: SchedulerConfig,
) {
    let lifecycle_loop = tokio::spawn(lifecycle_sweeps(
        Arc::clone(&lifecycle),
        Arc::clone(&billing),
        config.clone(),
    ));
    let retry_loop = tokio::spawn(retry_sweeps(lifecycle, billing, config));
    // The loops only return if their task is aborted.
    let _ = tokio::join!(lifecycle_loop, retry_loop);
}

async fn lifecycle_sweeps(
    lifecycle: Arc<Lifecycle>,
    billing: Arc<PaymentCoordinator>,
    config: SchedulerConfig,
) {
    let mut ticker = interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let started = Instant::now();
        let pass = async {
            let today = Utc::now().date_naive();
            let expired = lifecycle.expire_sweep(today);
            let suspended = lifecycle.suspend_sweep(today);
            let reminded = lifecycle.reminder_sweep(today);
            let renewed = lifecycle.renewal_sweep(&billing, today).await;
            info!(
                expired = expired.processed,
                suspended = suspended.processed,
                reminded = reminded.processed,
                renewed = renewed.processed,
                "lifecycle pass complete"
            );
        };
        if tokio::time::timeout(config.hard_timeout, pass).await.is_err() {
            warn!(
                timeout = ?config.hard_timeout,
                "lifecycle pass exceeded hard timeout and was abandoned"
            );
        } else if started.elapsed() > config.soft_timeout {
            warn!(elapsed = ?started.elapsed(), "lifecycle pass ran slow");
        }
    }
}

async fn retry_sweeps(
    lifecycle: Arc<Lifecycle>,
    billing: Arc<PaymentCoordinator>,
    config: SchedulerConfig,
) {
    let mut ticker = interval(config.retry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let report =
            billing.retry_failed_sweep(lifecycle.policy(), Utc::now(), Utc::now().date_naive());
        if report.matched > 0 {
            info!(
                matched = report.matched,
                processed = report.processed,
                failed = report.failed,
                "failed-payment replay pass complete"
            );
        }
    }
}
