//! Payment coordination: renewal charges with bounded retries and the
//! failed-payment replay sweep.
//!
//! Renewals run out-of-band, so no charge failure ever surfaces as a
//! synchronous user error: transient failures are retried with a linear
//! backoff, and only after exhaustion does a human hear about it (the
//! farmer by notification, the operator by admin alert). The subscription
//! is deliberately left `ACTIVE` and un-renewed on exhaustion; the next
//! expiry sweep catches it naturally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogError};
use crate::ids::SubscriptionId;
use crate::lifecycle::{LifecyclePolicy, SweepReport};
use crate::notify::{Notification, Notifier};
use crate::store::{NewPayment, Store};
use crate::subscription::{
    FarmerSubscription, Payment, PaymentKind, PaymentStatus, SubscriptionError,
    SubscriptionStatus,
};

/// Errors from a payment gateway charge attempt. All variants are treated
/// as transient and retried.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The gateway could not be reached or was overloaded.
    #[error("payment gateway temporarily unavailable: {0}")]
    Unavailable(String),

    /// The gateway rejected the charge.
    #[error("charge declined: {0}")]
    Declined(String),
}

/// Errors from the payment coordinator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PaymentError {
    /// Every retry attempt failed; an admin alert has been emitted.
    #[error("payment retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The last gateway error.
        last_error: String,
    },

    /// Ledger access failed.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// Catalog access failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// External payment gateway seam. The real integration is out of scope;
/// production wires [`SimulatedGateway`].
pub trait PaymentGateway: Send + Sync {
    /// Attempts to charge `amount_cents` against the farmer's payment
    /// method, returning the gateway transaction id.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] when the charge does not settle.
    fn charge(
        &self,
        subscription_id: SubscriptionId,
        amount_cents: i64,
        kind: PaymentKind,
    ) -> Result<String, GatewayError>;
}

/// Gateway stand-in that always settles and mints a transaction id.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedGateway;

impl PaymentGateway for SimulatedGateway {
    fn charge(
        &self,
        subscription_id: SubscriptionId,
        amount_cents: i64,
        kind: PaymentKind,
    ) -> Result<String, GatewayError> {
        let transaction_id = Uuid::new_v4().to_string();
        info!(%subscription_id, amount_cents, ?kind, transaction_id, "simulated charge settled");
        Ok(transaction_id)
    }
}

/// Retry policy for renewal charges: bounded attempts with a delay that
/// grows linearly with the attempt number (`base_delay x attempt`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum charge attempts per renewal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// How far back the failed-payment sweep looks when replaying.
    #[serde(default = "default_replay_window_days")]
    pub replay_window_days: u32,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay() -> Duration {
    Duration::from_secs(300)
}

const fn default_replay_window_days() -> u32 {
    7
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            replay_window_days: default_replay_window_days(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` (1-based) fails.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Coordinates renewal charges against the gateway and the ledger.
pub struct PaymentCoordinator {
    store: Arc<Store>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
}

impl PaymentCoordinator {
    /// Builds a coordinator.
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            policy,
        }
    }

    /// Charges one renewal for `subscription`, retrying transient
    /// failures up to the policy's attempt bound.
    ///
    /// Defensive against replays: if a `COMPLETED` renewal payment
    /// already covers the billing period ending at the subscription's
    /// current end date, that payment is returned and nothing is charged
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::Exhausted`] after the last attempt fails;
    /// ledger and catalog errors pass through.
    pub async fn charge_renewal(
        &self,
        subscription: &FarmerSubscription,
        today: NaiveDate,
    ) -> Result<Payment, PaymentError> {
        let period_end = subscription.end_date.unwrap_or(today);

        if let Some(settled) = self.store.completed_renewal(subscription.id, period_end)? {
            info!(
                subscription_id = %subscription.id, %period_end,
                "renewal already settled for this period; skipping charge"
            );
            return Ok(settled);
        }

        let plan = self
            .store
            .subscription_type(subscription.subscription_type_id)?
            .ok_or(SubscriptionError::SubscriptionTypeNotFound {
                id: subscription.subscription_type_id,
            })?;

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            let payment = self.store.create_payment(&NewPayment {
                subscription_id: subscription.id,
                amount_cents: plan.cost_cents,
                kind: PaymentKind::Renewal,
                status: PaymentStatus::Pending,
                due_date: None,
                period_end: Some(period_end),
                notes: format!("Renewal for {} subscription", plan.name),
            })?;

            match self
                .gateway
                .charge(subscription.id, plan.cost_cents, PaymentKind::Renewal)
            {
                Ok(transaction_id) => {
                    let payment = self.store.complete_payment(payment.id, &transaction_id)?;
                    info!(
                        subscription_id = %subscription.id, payment_id = %payment.id,
                        attempt, "renewal payment settled"
                    );
                    return Ok(payment);
                }
                Err(err) => {
                    warn!(
                        subscription_id = %subscription.id, payment_id = %payment.id,
                        attempt, error = %err, "renewal charge failed"
                    );
                    self.store.fail_payment(payment.id, &err.to_string())?;
                    self.notifier.notify(Notification::PaymentFailed {
                        subscription_id: subscription.id,
                        farmer_id: subscription.farmer_id,
                        attempt,
                        error: err.to_string(),
                    });
                    last_error = err.to_string();
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        error!(
            subscription_id = %subscription.id,
            attempts = self.policy.max_attempts,
            "renewal payment exhausted retries"
        );
        self.notifier.notify(Notification::AdminPaymentExhausted {
            subscription_id: subscription.id,
            amount_cents: plan.cost_cents,
            attempts: self.policy.max_attempts,
            error: last_error.clone(),
        });
        Err(PaymentError::Exhausted {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    /// Replays recent `FAILED` payments, one attempt per payment per
    /// sweep run (the sweep cadence provides the spacing between
    /// attempts). A renewal payment that settles extends its
    /// subscription's end date by one billing period.
    ///
    /// Only payments from the replay window with fewer than
    /// `max_attempts` replays are considered; payments whose subscription
    /// is no longer `ACTIVE` are skipped.
    pub fn retry_failed_sweep(
        &self,
        lifecycle: &LifecyclePolicy,
        now: DateTime<Utc>,
        today: NaiveDate,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = now - chrono::Duration::days(i64::from(self.policy.replay_window_days));
        let failed = match self
            .store
            .failed_payments_since(cutoff, self.policy.max_attempts)
        {
            Ok(failed) => failed,
            Err(err) => {
                error!(error = %err, "failed-payment sweep could not enumerate payments");
                return report;
            }
        };

        for payment in failed {
            report.matched += 1;
            if let Err(err) = self.replay_payment(&payment, lifecycle, today) {
                error!(
                    payment_id = %payment.id, error = %err,
                    "failed-payment replay errored"
                );
                report.failed += 1;
            } else {
                report.processed += 1;
            }
        }
        info!(
            matched = report.matched, processed = report.processed, failed = report.failed,
            "failed-payment sweep complete"
        );
        report
    }

    fn replay_payment(
        &self,
        payment: &Payment,
        lifecycle: &LifecyclePolicy,
        today: NaiveDate,
    ) -> Result<(), PaymentError> {
        let subscription = self.store.subscription(payment.subscription_id)?;
        if subscription.status != SubscriptionStatus::Active {
            info!(
                payment_id = %payment.id, subscription_id = %subscription.id,
                status = %subscription.status, "skipping replay for non-active subscription"
            );
            return Ok(());
        }

        let attempt = self.store.bump_retry(payment.id)?;
        match self
            .gateway
            .charge(subscription.id, payment.amount_cents, payment.kind)
        {
            Ok(transaction_id) => {
                self.store.complete_payment(payment.id, &transaction_id)?;
                info!(payment_id = %payment.id, attempt, "replayed payment settled");
                if payment.kind == PaymentKind::Renewal {
                    let new_end = self.store.extend_subscription(
                        subscription.id,
                        lifecycle.period_days,
                        today,
                    )?;
                    self.notifier.notify(Notification::RenewalConfirmation {
                        subscription_id: subscription.id,
                        farmer_id: subscription.farmer_id,
                        new_end_date: new_end,
                    });
                }
                Ok(())
            }
            Err(err) => {
                warn!(payment_id = %payment.id, attempt, error = %err, "replayed payment failed");
                self.store.fail_payment(payment.id, &err.to_string())?;
                self.notifier.notify(Notification::PaymentFailed {
                    subscription_id: subscription.id,
                    farmer_id: subscription.farmer_id,
                    attempt,
                    error: err.to_string(),
                });
                Ok(())
            }
        }
    }
}

/// Gateway that fails a configured number of charges before settling.
/// Test-only.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FlakyGateway {
    failures_remaining: std::sync::Mutex<u32>,
    charges: std::sync::Mutex<u32>,
}

#[cfg(test)]
impl FlakyGateway {
    pub(crate) fn failing(times: u32) -> Self {
        Self {
            failures_remaining: std::sync::Mutex::new(times),
            charges: std::sync::Mutex::new(0),
        }
    }

    pub(crate) fn charges_made(&self) -> u32 {
        *self.charges.lock().unwrap()
    }
}

#[cfg(test)]
impl PaymentGateway for FlakyGateway {
    fn charge(
        &self,
        _subscription_id: SubscriptionId,
        _amount_cents: i64,
        _kind: PaymentKind,
    ) -> Result<String, GatewayError> {
        *self.charges.lock().unwrap() += 1;
        let mut remaining = self.failures_remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(GatewayError::Unavailable(
                "gateway connection reset".to_string(),
            ));
        }
        Ok(Uuid::new_v4().to_string())
    }
}
