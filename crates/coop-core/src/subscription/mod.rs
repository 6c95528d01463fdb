//! Subscription ledger entities and the lifecycle state machine.
//!
//! A farmer may accumulate many historical subscription rows but holds at
//! most one `ACTIVE` row at any instant; terminal rows are kept as audit
//! history and never hard-deleted.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::text_enum_sql;
use crate::ids::{AllocationId, FarmerId, PaymentId, ResourceId, SubscriptionId, SubscriptionTypeId};

mod error;

pub use error::SubscriptionError;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;

/// Lifecycle state of a subscription row.
///
/// ```text
/// PENDING ---> ACTIVE ---> { SUSPENDED, EXPIRED, CANCELLED }
///    |            ^
///    +-> SUSPENDED +-> CANCELLED
/// ```
///
/// `CANCELLED` and `EXPIRED` are terminal; a new row is created for any
/// subsequent subscription. `SUSPENDED` may be reinstated to `ACTIVE` or
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    /// Created but awaiting payment.
    Pending,
    /// In force.
    Active,
    /// Payment overdue past the grace window.
    Suspended,
    /// Terminated by the farmer or superseded by an upgrade.
    Cancelled,
    /// Passed its end date.
    Expired,
}

impl SubscriptionStatus {
    /// Canonical string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "ACTIVE" => Some(Self::Active),
            "SUSPENDED" => Some(Self::Suspended),
            "CANCELLED" => Some(Self::Cancelled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Returns `true` when no further transition out of this state is
    /// permitted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }

    /// Whether the state machine permits `self -> next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active | Self::Suspended | Self::Cancelled)
                | (Self::Active, Self::Suspended | Self::Expired | Self::Cancelled)
                | (Self::Suspended, Self::Active | Self::Cancelled)
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

text_enum_sql!(SubscriptionStatus);

/// A ledger entry recording one farmer's subscription to a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmerSubscription {
    /// Ledger id.
    pub id: SubscriptionId,
    /// Owning farmer.
    pub farmer_id: FarmerId,
    /// Plan this subscription is for.
    pub subscription_type_id: SubscriptionTypeId,
    /// First day the subscription is in force.
    pub start_date: NaiveDate,
    /// Last day the subscription is in force; `None` until computed.
    pub end_date: Option<NaiveDate>,
    /// Lifecycle state.
    pub status: SubscriptionStatus,
    /// Renew automatically at the end of the billing period.
    pub auto_renew: bool,
    /// Operator notes (e.g. upgrade audit trail).
    pub notes: String,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl FarmerSubscription {
    /// The `is_active` predicate: status is `ACTIVE` and the end date, if
    /// set, has not passed.
    #[must_use]
    pub fn is_active(&self, today: NaiveDate) -> bool {
        self.status == SubscriptionStatus::Active
            && self.end_date.is_none_or(|end| end >= today)
    }

    /// Days remaining until the end date, clamped to at least one so a
    /// same-day upgrade still earns one day of credit.
    #[must_use]
    pub fn remaining_days(&self, today: NaiveDate) -> i64 {
        let remaining = self
            .end_date
            .map_or(0, |end| (end - today).num_days());
        remaining.max(1)
    }
}

/// An allocation edge binding a resource (with quantity) to a
/// subscription.
///
/// Allocations are deactivated on detach or cancellation, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Row id.
    pub id: AllocationId,
    /// The subscription this allocation belongs to.
    pub subscription_id: SubscriptionId,
    /// The allocated resource.
    pub resource_id: ResourceId,
    /// Allocated quantity.
    pub quantity: u32,
    /// Active allocations count against quota (unless the resource is
    /// basic).
    pub active: bool,
    /// When the allocation was made.
    pub allocated_at: DateTime<Utc>,
}

/// Payment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Created, not yet settled.
    Pending,
    /// Settled successfully. Immutable afterwards except for refunds.
    Completed,
    /// A charge attempt failed; eligible for the retry sweep.
    Failed,
    /// Refunded after completion.
    Refunded,
}

impl PaymentStatus {
    /// Canonical string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "REFUNDED" => Some(Self::Refunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

text_enum_sql!(PaymentStatus);

/// What a payment is for. Replaces description-string sniffing: the retry
/// sweep extends the subscription only for `Renewal` payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentKind {
    /// Automatic renewal charge for an existing subscription.
    Renewal,
    /// Initial purchase or other one-off charge.
    Purchase,
}

impl PaymentKind {
    /// Canonical string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Renewal => "RENEWAL",
            Self::Purchase => "PURCHASE",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RENEWAL" => Some(Self::Renewal),
            "PURCHASE" => Some(Self::Purchase),
            _ => None,
        }
    }
}

text_enum_sql!(PaymentKind);

/// A payment record linked to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Row id.
    pub id: PaymentId,
    /// The subscription this payment charges.
    pub subscription_id: SubscriptionId,
    /// Amount in cents.
    pub amount_cents: i64,
    /// What the payment is for.
    pub kind: PaymentKind,
    /// Payment state.
    pub status: PaymentStatus,
    /// When payment is due (payment-gated creation and suspension
    /// grace).
    pub due_date: Option<NaiveDate>,
    /// The billing-period end a renewal payment covers. Used to detect an
    /// already-settled renewal before charging again.
    pub period_end: Option<NaiveDate>,
    /// Gateway transaction id, set on completion.
    pub transaction_id: Option<String>,
    /// Settlement time.
    pub paid_at: Option<DateTime<Utc>>,
    /// Replay attempts made by the failed-payment sweep.
    pub retry_count: u32,
    /// Last replay attempt time.
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Free-form notes.
    pub notes: String,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(status: SubscriptionStatus, end: Option<&str>) -> FarmerSubscription {
        FarmerSubscription {
            id: SubscriptionId(1),
            farmer_id: FarmerId(1),
            subscription_type_id: SubscriptionTypeId(1),
            start_date: "2026-01-01".parse().unwrap(),
            end_date: end.map(|d| d.parse().unwrap()),
            status,
            auto_renew: true,
            notes: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn is_active_requires_active_status_and_unexpired_end_date() {
        let today: NaiveDate = "2026-01-15".parse().unwrap();

        assert!(subscription(SubscriptionStatus::Active, Some("2026-01-31")).is_active(today));
        assert!(subscription(SubscriptionStatus::Active, Some("2026-01-15")).is_active(today));
        assert!(subscription(SubscriptionStatus::Active, None).is_active(today));
        assert!(!subscription(SubscriptionStatus::Active, Some("2026-01-14")).is_active(today));
        assert!(!subscription(SubscriptionStatus::Pending, Some("2026-01-31")).is_active(today));
        assert!(!subscription(SubscriptionStatus::Cancelled, None).is_active(today));
    }

    #[test]
    fn remaining_days_clamps_to_one() {
        let today: NaiveDate = "2026-01-15".parse().unwrap();

        assert_eq!(
            subscription(SubscriptionStatus::Active, Some("2026-01-25")).remaining_days(today),
            10
        );
        assert_eq!(
            subscription(SubscriptionStatus::Active, Some("2026-01-10")).remaining_days(today),
            1
        );
        assert_eq!(
            subscription(SubscriptionStatus::Active, None).remaining_days(today),
            1
        );
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        use SubscriptionStatus::*;
        for next in [Pending, Active, Suspended, Cancelled, Expired] {
            assert!(!Cancelled.can_transition_to(next));
            assert!(!Expired.can_transition_to(next));
        }
    }

    #[test]
    fn state_machine_matches_lifecycle_design() {
        use SubscriptionStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Suspended));
        assert!(Active.can_transition_to(Expired));
        assert!(Active.can_transition_to(Cancelled));
        assert!(Suspended.can_transition_to(Active));
        assert!(Suspended.can_transition_to(Cancelled));
        assert!(!Active.can_transition_to(Pending));
        assert!(!Suspended.can_transition_to(Expired));
    }
}
