//! Subscription-specific error types.

use thiserror::Error;

use crate::catalog::{CatalogError, SlotFamily, Tier};
use crate::ids::{ResourceId, SubscriptionId, SubscriptionTypeId};

use super::SubscriptionStatus;

/// Errors raised by subscription lifecycle and entitlement operations.
///
/// Every business-rule violation carries a stable machine code (see
/// [`SubscriptionError::code`]) which the API layer surfaces alongside the
/// human-readable message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SubscriptionError {
    /// The subscription has no remaining quota for the resource's slot
    /// family.
    #[error(
        "subscription {subscription_id} has no remaining {family} capacity; upgrade the subscription to add more"
    )]
    LimitExceeded {
        /// The subscription that is at its limit.
        subscription_id: SubscriptionId,
        /// The slot family that is exhausted.
        family: SlotFamily,
    },

    /// Operation requires an active subscription.
    #[error("subscription {subscription_id} is not active")]
    Inactive {
        /// The inactive subscription.
        subscription_id: SubscriptionId,
    },

    /// Upgrades must move to a strictly higher tier.
    #[error("new subscription type must be of a higher tier: current={current}, requested={requested}")]
    InvalidTierTransition {
        /// Tier of the current subscription's plan.
        current: Tier,
        /// Tier of the requested plan.
        requested: Tier,
    },

    /// The requested state change violates the lifecycle state machine.
    #[error("subscription {subscription_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        /// The subscription being transitioned.
        subscription_id: SubscriptionId,
        /// Current status.
        from: SubscriptionStatus,
        /// Requested status.
        to: SubscriptionStatus,
    },

    /// Unknown subscription id.
    #[error("subscription not found: {id}")]
    SubscriptionNotFound {
        /// The id that was not found.
        id: SubscriptionId,
    },

    /// Unknown subscription type id.
    #[error("subscription type not found: {id}")]
    SubscriptionTypeNotFound {
        /// The id that was not found.
        id: SubscriptionTypeId,
    },

    /// Unknown or inactive resource id.
    #[error("resource not found: {id}")]
    ResourceNotFound {
        /// The id that was not found.
        id: ResourceId,
    },

    /// No active allocation of this resource on this subscription.
    #[error("subscription {subscription_id} has no active allocation of resource {resource_id}")]
    AllocationNotFound {
        /// The subscription.
        subscription_id: SubscriptionId,
        /// The resource that is not allocated.
        resource_id: ResourceId,
    },

    /// The resource is already allocated to this subscription.
    #[error("resource {resource_id} is already allocated to subscription {subscription_id}")]
    DuplicateResource {
        /// The subscription.
        subscription_id: SubscriptionId,
        /// The already-allocated resource.
        resource_id: ResourceId,
    },

    /// Basic resources are granted automatically and cannot be attached
    /// explicitly.
    #[error("resource {resource_id} is basic and is granted to every subscription automatically")]
    BasicAutoGranted {
        /// The basic resource.
        resource_id: ResourceId,
    },

    /// The subscription is awaiting payment before it activates.
    #[error("subscription {subscription_id} requires payment before resources can be added")]
    PaymentRequired {
        /// The pending subscription.
        subscription_id: SubscriptionId,
    },

    /// Catalog lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl SubscriptionError {
    /// Stable machine-readable code for API error payloads.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LimitExceeded { .. } => "subscription_limit_exceeded",
            Self::Inactive { .. } => "subscription_inactive",
            Self::InvalidTierTransition { .. } => "invalid_tier_transition",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::SubscriptionNotFound { .. }
            | Self::SubscriptionTypeNotFound { .. }
            | Self::ResourceNotFound { .. }
            | Self::AllocationNotFound { .. } => "not_found",
            Self::DuplicateResource { .. } => "duplicate_resource",
            Self::BasicAutoGranted { .. } => "basic_auto_granted",
            Self::PaymentRequired { .. } => "payment_required",
            Self::Catalog(_) | Self::Database(_) => "internal",
        }
    }

    /// Whether this error means "the id does not exist".
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionNotFound { .. }
                | Self::SubscriptionTypeNotFound { .. }
                | Self::ResourceNotFound { .. }
                | Self::AllocationNotFound { .. }
        )
    }
}
