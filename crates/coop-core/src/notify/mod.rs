//! Notification fan-out for lifecycle and billing events.
//!
//! Email rendering and delivery are external collaborators; this module
//! only defines the event surface. Production wires [`TracingNotifier`],
//! tests wire [`RecordingNotifier`] and assert on what was sent.

use std::sync::Mutex;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::ids::{FarmerId, SubscriptionId};

/// A lifecycle or billing event that should reach a human.
///
/// `Admin*` variants target operators; the rest target the owning farmer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// An active subscription passed its end date and was expired.
    SubscriptionExpired {
        /// The expired subscription.
        subscription_id: SubscriptionId,
        /// The owning farmer.
        farmer_id: FarmerId,
        /// The end date that passed.
        expired_on: NaiveDate,
    },

    /// An auto-renewing subscription renews soon.
    RenewalReminder {
        /// The subscription due for renewal.
        subscription_id: SubscriptionId,
        /// The owning farmer.
        farmer_id: FarmerId,
        /// The upcoming renewal date.
        renewal_date: NaiveDate,
        /// The renewal charge, in cents.
        amount_cents: i64,
    },

    /// A non-auto-renewing subscription ends soon; the farmer must act.
    PaymentReminder {
        /// The ending subscription.
        subscription_id: SubscriptionId,
        /// The owning farmer.
        farmer_id: FarmerId,
        /// The end date.
        renewal_date: NaiveDate,
        /// The renewal cost, in cents.
        amount_cents: i64,
    },

    /// A renewal payment settled and the subscription was extended.
    RenewalConfirmation {
        /// The renewed subscription.
        subscription_id: SubscriptionId,
        /// The owning farmer.
        farmer_id: FarmerId,
        /// The extended end date.
        new_end_date: NaiveDate,
    },

    /// A payment attempt failed; a retry may follow.
    PaymentFailed {
        /// The affected subscription.
        subscription_id: SubscriptionId,
        /// The owning farmer.
        farmer_id: FarmerId,
        /// Which attempt failed (1-based).
        attempt: u32,
        /// Gateway error message.
        error: String,
    },

    /// A renewal could not be completed during the renewal sweep.
    AdminRenewalFailure {
        /// The subscription left un-renewed.
        subscription_id: SubscriptionId,
    },

    /// All payment retries were exhausted; human intervention needed.
    AdminPaymentExhausted {
        /// The subscription left un-renewed.
        subscription_id: SubscriptionId,
        /// The amount that could not be charged, in cents.
        amount_cents: i64,
        /// Attempts made.
        attempts: u32,
        /// Last gateway error.
        error: String,
    },
}

/// Sink for [`Notification`]s.
///
/// Implementations must not fail the caller: delivery problems are the
/// sink's to log, never the lifecycle's to unwind.
pub trait Notifier: Send + Sync {
    /// Delivers one notification.
    fn notify(&self, notification: Notification);
}

/// Notifier that emits structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::SubscriptionExpired {
                subscription_id,
                farmer_id,
                expired_on,
            } => info!(%subscription_id, %farmer_id, %expired_on, "subscription expired"),
            Notification::RenewalReminder {
                subscription_id,
                farmer_id,
                renewal_date,
                ..
            } => info!(%subscription_id, %farmer_id, %renewal_date, "renewal reminder"),
            Notification::PaymentReminder {
                subscription_id,
                farmer_id,
                renewal_date,
                ..
            } => info!(%subscription_id, %farmer_id, %renewal_date, "payment reminder"),
            Notification::RenewalConfirmation {
                subscription_id,
                farmer_id,
                new_end_date,
            } => info!(%subscription_id, %farmer_id, %new_end_date, "subscription renewed"),
            Notification::PaymentFailed {
                subscription_id,
                farmer_id,
                attempt,
                error,
            } => warn!(%subscription_id, %farmer_id, attempt, error, "payment attempt failed"),
            Notification::AdminRenewalFailure { subscription_id } => {
                error!(%subscription_id, "renewal failed; admin attention required");
            }
            Notification::AdminPaymentExhausted {
                subscription_id,
                amount_cents,
                attempts,
                error,
            } => error!(
                %subscription_id, amount_cents, attempts, error,
                "payment retries exhausted; admin attention required"
            ),
        }
    }
}

/// Notifier that records everything it is given, for assertions in
/// tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// Drains and returns everything sent so far.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}
