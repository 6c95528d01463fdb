//! Subscription lifecycle service and the scheduled sweeps.
//!
//! The sweeps enumerate due work from the ledger and dispatch to
//! idempotent handlers: a subscription already moved to its target state
//! simply stops matching the sweep's predicate, so re-running a sweep is
//! a no-op (no duplicate notifications, no state corruption). Per-row
//! failures are logged and counted, never allowed to abort the rest of
//! the sweep.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::billing::PaymentCoordinator;
use crate::catalog::Catalog;
use crate::entitlement::Utilization;
use crate::ids::{ResourceId, SubscriptionId, SubscriptionTypeId};
use crate::notify::{Notification, Notifier};
use crate::store::{CreateSubscription, Store, UpgradeOutcome};
use crate::subscription::{Allocation, FarmerSubscription, SubscriptionError, SubscriptionStatus};

/// How a newly purchased subscription activates.
///
/// The platform historically activated immediately with no payment gate,
/// while a separate suspension path assumed payment-gated `PENDING` rows.
/// Both flows are supported; deployment configuration chooses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPolicy {
    /// New subscriptions start `ACTIVE` with no payment gate.
    Immediate,
    /// New subscriptions start `PENDING` with a pending payment due on
    /// the purchase date; the suspension sweep catches unpaid ones.
    PaymentGated,
}

/// Tunable lifecycle constants. Defaults match the platform's billing
/// rules: 30-day periods, 3-day renewal/reminder windows, 7-day payment
/// grace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// Days per billing period.
    #[serde(default = "default_period_days")]
    pub period_days: u32,

    /// Renewal sweep window: end dates within `[today - n, today + n]`
    /// are due.
    #[serde(default = "default_renewal_window_days")]
    pub renewal_window_days: u32,

    /// Reminder sweep horizon: subscriptions ending within `n` days get
    /// a reminder.
    #[serde(default = "default_reminder_days")]
    pub reminder_days: u32,

    /// Days past a pending payment's due date before the subscription is
    /// suspended.
    #[serde(default = "default_payment_grace_days")]
    pub payment_grace_days: u32,

    /// How new subscriptions activate.
    #[serde(default = "default_activation")]
    pub activation: ActivationPolicy,
}

const fn default_period_days() -> u32 {
    30
}

const fn default_renewal_window_days() -> u32 {
    3
}

const fn default_reminder_days() -> u32 {
    3
}

const fn default_payment_grace_days() -> u32 {
    7
}

const fn default_activation() -> ActivationPolicy {
    ActivationPolicy::Immediate
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            period_days: default_period_days(),
            renewal_window_days: default_renewal_window_days(),
            reminder_days: default_reminder_days(),
            payment_grace_days: default_payment_grace_days(),
            activation: default_activation(),
        }
    }
}

/// Outcome counters for one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Rows matching the sweep predicate.
    pub matched: usize,
    /// Rows successfully processed.
    pub processed: usize,
    /// Rows that errored (logged and skipped).
    pub failed: usize,
}

/// The lifecycle service: request-path operations plus the scheduled
/// sweeps, all against the shared store.
pub struct Lifecycle {
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    policy: LifecyclePolicy,
}

impl Lifecycle {
    /// Builds the service.
    pub fn new(store: Arc<Store>, notifier: Arc<dyn Notifier>, policy: LifecyclePolicy) -> Self {
        Self {
            store,
            notifier,
            policy,
        }
    }

    /// The active policy.
    #[must_use]
    pub const fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Request-path operations
    // ------------------------------------------------------------------

    /// Creates a subscription (see [`Store::create_subscription`]).
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub fn create_subscription(
        &self,
        req: &CreateSubscription,
        today: NaiveDate,
    ) -> Result<FarmerSubscription, SubscriptionError> {
        self.store.create_subscription(req, &self.policy, today)
    }

    /// Upgrades a subscription to a strictly higher tier (see
    /// [`Store::upgrade_subscription`]).
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub fn upgrade_subscription(
        &self,
        subscription_id: SubscriptionId,
        new_type_id: SubscriptionTypeId,
        today: NaiveDate,
    ) -> Result<UpgradeOutcome, SubscriptionError> {
        self.store
            .upgrade_subscription(subscription_id, new_type_id, today, &self.policy)
    }

    /// Flags an active subscription to lapse at its end date.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub fn cancel_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<FarmerSubscription, SubscriptionError> {
        self.store.cancel_subscription(subscription_id)
    }

    /// Attaches a resource under quota (see [`Store::attach_resource`]).
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub fn attach_resource(
        &self,
        subscription_id: SubscriptionId,
        resource_id: ResourceId,
        quantity: u32,
        today: NaiveDate,
    ) -> Result<Allocation, SubscriptionError> {
        self.store
            .attach_resource(subscription_id, resource_id, quantity, today)
    }

    /// Reads a subscription's utilization.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub fn utilization(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Utilization, SubscriptionError> {
        self.store.utilization(subscription_id)
    }

    // ------------------------------------------------------------------
    // Scheduled sweeps
    // ------------------------------------------------------------------

    /// Expires every `ACTIVE` subscription whose end date has passed and
    /// notifies each owner once.
    pub fn expire_sweep(&self, today: NaiveDate) -> SweepReport {
        let mut report = SweepReport::default();
        let expired = match self.store.expired_active(today) {
            Ok(expired) => expired,
            Err(err) => {
                error!(error = %err, "expiry sweep could not enumerate subscriptions");
                return report;
            }
        };

        for subscription in expired {
            report.matched += 1;
            match self
                .store
                .transition(subscription.id, SubscriptionStatus::Expired, None)
            {
                Ok(_) => {
                    self.notifier.notify(Notification::SubscriptionExpired {
                        subscription_id: subscription.id,
                        farmer_id: subscription.farmer_id,
                        // Guarded by the sweep predicate: matched rows
                        // always carry an end date.
                        expired_on: subscription.end_date.unwrap_or(today),
                    });
                    report.processed += 1;
                }
                Err(err) => {
                    error!(
                        subscription_id = %subscription.id, error = %err,
                        "failed to expire subscription"
                    );
                    report.failed += 1;
                }
            }
        }
        info!(
            matched = report.matched, processed = report.processed, failed = report.failed,
            "expiry sweep complete"
        );
        report
    }

    /// Suspends `PENDING` subscriptions whose payment is overdue past
    /// the grace window.
    pub fn suspend_sweep(&self, today: NaiveDate) -> SweepReport {
        let mut report = SweepReport::default();
        let overdue = match self
            .store
            .overdue_pending(today, self.policy.payment_grace_days)
        {
            Ok(overdue) => overdue,
            Err(err) => {
                error!(error = %err, "suspension sweep could not enumerate subscriptions");
                return report;
            }
        };

        for subscription in overdue {
            report.matched += 1;
            match self.store.transition(
                subscription.id,
                SubscriptionStatus::Suspended,
                Some("Suspended: payment overdue"),
            ) {
                Ok(_) => report.processed += 1,
                Err(err) => {
                    error!(
                        subscription_id = %subscription.id, error = %err,
                        "failed to suspend subscription"
                    );
                    report.failed += 1;
                }
            }
        }
        info!(
            matched = report.matched, processed = report.processed, failed = report.failed,
            "suspension sweep complete"
        );
        report
    }

    /// Reminds owners of subscriptions ending within the reminder
    /// horizon: renewal reminders for auto-renewing rows, payment
    /// reminders for the rest.
    pub fn reminder_sweep(&self, today: NaiveDate) -> SweepReport {
        let mut report = SweepReport::default();
        let ending = match self.store.expiring_soon(today, self.policy.reminder_days) {
            Ok(ending) => ending,
            Err(err) => {
                error!(error = %err, "reminder sweep could not enumerate subscriptions");
                return report;
            }
        };

        for subscription in ending {
            report.matched += 1;
            let amount_cents = match self.store.subscription_type(subscription.subscription_type_id)
            {
                Ok(Some(plan)) => plan.cost_cents,
                Ok(None) | Err(_) => {
                    error!(
                        subscription_id = %subscription.id,
                        "reminder sweep could not resolve plan"
                    );
                    report.failed += 1;
                    continue;
                }
            };
            let renewal_date = subscription.end_date.unwrap_or(today);
            let notification = if subscription.auto_renew {
                Notification::RenewalReminder {
                    subscription_id: subscription.id,
                    farmer_id: subscription.farmer_id,
                    renewal_date,
                    amount_cents,
                }
            } else {
                Notification::PaymentReminder {
                    subscription_id: subscription.id,
                    farmer_id: subscription.farmer_id,
                    renewal_date,
                    amount_cents,
                }
            };
            self.notifier.notify(notification);
            report.processed += 1;
        }
        info!(
            matched = report.matched, processed = report.processed, failed = report.failed,
            "reminder sweep complete"
        );
        report
    }

    /// Renews auto-renewing subscriptions whose end date falls in the
    /// renewal window: charges through the coordinator, and on success
    /// extends the end date in place by one billing period (no new
    /// ledger row). A failed charge leaves the row `ACTIVE` and
    /// un-renewed and raises an admin alert; the expiry sweep catches it
    /// later.
    pub async fn renewal_sweep(
        &self,
        billing: &PaymentCoordinator,
        today: NaiveDate,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let due = match self
            .store
            .renewal_due(today, self.policy.renewal_window_days)
        {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "renewal sweep could not enumerate subscriptions");
                return report;
            }
        };

        for subscription in due {
            report.matched += 1;
            match billing.charge_renewal(&subscription, today).await {
                Ok(_) => {
                    match self.store.extend_subscription(
                        subscription.id,
                        self.policy.period_days,
                        today,
                    ) {
                        Ok(new_end) => {
                            self.notifier.notify(Notification::RenewalConfirmation {
                                subscription_id: subscription.id,
                                farmer_id: subscription.farmer_id,
                                new_end_date: new_end,
                            });
                            info!(
                                subscription_id = %subscription.id, %new_end,
                                "subscription renewed"
                            );
                            report.processed += 1;
                        }
                        Err(err) => {
                            error!(
                                subscription_id = %subscription.id, error = %err,
                                "renewal payment settled but extension failed"
                            );
                            report.failed += 1;
                        }
                    }
                }
                Err(err) => {
                    error!(
                        subscription_id = %subscription.id, error = %err,
                        "renewal charge failed; subscription left active"
                    );
                    self.notifier.notify(Notification::AdminRenewalFailure {
                        subscription_id: subscription.id,
                    });
                    report.failed += 1;
                }
            }
        }
        info!(
            matched = report.matched, processed = report.processed, failed = report.failed,
            "renewal sweep complete"
        );
        report
    }
}

#[cfg(test)]
mod tests;
