//! `SQLite`-backed persistence for the subscription engine.
//!
//! The store owns a single connection behind a mutex and runs every
//! check-then-act sequence (quota check + allocation insert, tier check +
//! supersede, renewal extension) inside one immediate transaction. That
//! pessimistic choice serializes lifecycle transitions per subscription:
//! two concurrent attach calls cannot both observe headroom and both
//! insert.

// SQLite returns i64 for rowids and counts; quantities and limits are
// small non-negative values. Mutex poisoning indicates a panic in another
// thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{
    params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{
    Catalog, CatalogError, NewResource, NewSubscriptionType, Resource, SubscriptionType,
};
use crate::entitlement::{self, Utilization};
use crate::ids::{FarmerId, PaymentId, ResourceId, SubscriptionId, SubscriptionTypeId};
use crate::lifecycle::{ActivationPolicy, LifecyclePolicy};
use crate::subscription::{
    Allocation, FarmerSubscription, Payment, PaymentKind, PaymentStatus, SubscriptionError,
    SubscriptionStatus,
};


/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Request to create a subscription for a farmer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscription {
    /// The purchasing farmer.
    pub farmer_id: FarmerId,
    /// The plan to subscribe to.
    pub subscription_type_id: SubscriptionTypeId,
    /// Duration in billing periods (months).
    pub duration_months: u32,
    /// Renew automatically at period end.
    pub auto_renew: bool,
}

/// Result of a tier upgrade: the superseding row plus what was carried
/// over.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeOutcome {
    /// The new active subscription.
    pub new_subscription: FarmerSubscription,
    /// The cancelled (superseded) subscription.
    pub previous_subscription_id: SubscriptionId,
    /// Non-basic resources migrated onto the new subscription.
    pub migrated: Vec<ResourceId>,
    /// Non-basic resources that did not fit the new plan's limits.
    pub skipped: Vec<ResourceId>,
    /// Advisory prorated credit for the unused remainder of the old
    /// subscription, in cents. Computed but not charged.
    pub prorated_credit_cents: i64,
}

/// Input for recording a payment.
#[derive(Debug, Clone)]
pub struct NewPayment {
    /// The subscription being charged.
    pub subscription_id: SubscriptionId,
    /// Amount in cents.
    pub amount_cents: i64,
    /// What the payment is for.
    pub kind: PaymentKind,
    /// Initial status.
    pub status: PaymentStatus,
    /// When payment is due, if gated.
    pub due_date: Option<NaiveDate>,
    /// Billing-period end a renewal covers.
    pub period_end: Option<NaiveDate>,
    /// Free-form notes.
    pub notes: String,
}

/// `SQLite`-backed subscription store.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

impl Store {
    /// Opens (creating if necessary) a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SubscriptionError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens an in-memory store (tests and ephemeral runs).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, SubscriptionError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    // ------------------------------------------------------------------
    // Catalog writes (admin tooling)
    // ------------------------------------------------------------------

    /// Inserts a subscription type and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error on constraint violation (duplicate name) or
    /// storage failure.
    pub fn insert_subscription_type(
        &self,
        new: &NewSubscriptionType,
    ) -> Result<SubscriptionTypeId, CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO subscription_types (
                name, tier, farm_size, cost_cents, max_hardware_nodes,
                max_software_services, includes_predictions, includes_analytics, description
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.name,
                new.tier,
                new.farm_size,
                new.cost_cents,
                new.max_hardware_nodes,
                new.max_software_services,
                new.includes_predictions,
                new.includes_analytics,
                new.description,
            ],
        )?;
        Ok(SubscriptionTypeId(conn.last_insert_rowid()))
    }

    /// Inserts a resource and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error on constraint violation (duplicate name) or
    /// storage failure.
    pub fn insert_resource(&self, new: &NewResource) -> Result<ResourceId, CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO resources (
                name, resource_type, category, unit_cost_cents, is_basic, active, description
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.name,
                new.resource_type,
                new.category,
                new.unit_cost_cents,
                new.is_basic,
                new.active,
                new.description,
            ],
        )?;
        Ok(ResourceId(conn.last_insert_rowid()))
    }

    // ------------------------------------------------------------------
    // Subscription lifecycle
    // ------------------------------------------------------------------

    /// Creates a subscription for a farmer.
    ///
    /// Cancels any existing `ACTIVE` subscription for the farmer (at most
    /// one winner), grants every basic resource, and sets the end date to
    /// `start + period_days x duration_months`. Under
    /// [`ActivationPolicy::Immediate`] the row starts `ACTIVE`; under
    /// [`ActivationPolicy::PaymentGated`] it starts `PENDING` with a
    /// pending payment due today.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::SubscriptionTypeNotFound`] for an
    /// unknown plan, or a database error.
    pub fn create_subscription(
        &self,
        req: &CreateSubscription,
        policy: &LifecyclePolicy,
        today: NaiveDate,
    ) -> Result<FarmerSubscription, SubscriptionError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let plan = subscription_type_tx(&tx, req.subscription_type_id)?.ok_or(
            SubscriptionError::SubscriptionTypeNotFound {
                id: req.subscription_type_id,
            },
        )?;

        let now = Utc::now();
        tx.execute(
            "UPDATE subscriptions SET status = ?1, updated_at = ?2
             WHERE farmer_id = ?3 AND status = ?4",
            params![
                SubscriptionStatus::Cancelled,
                now,
                req.farmer_id,
                SubscriptionStatus::Active,
            ],
        )?;

        let end_date =
            today + Duration::days(i64::from(policy.period_days) * i64::from(req.duration_months));
        let status = match policy.activation {
            ActivationPolicy::Immediate => SubscriptionStatus::Active,
            ActivationPolicy::PaymentGated => SubscriptionStatus::Pending,
        };

        tx.execute(
            "INSERT INTO subscriptions (
                farmer_id, subscription_type_id, start_date, end_date, status,
                auto_renew, notes, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, '', ?7, ?7)",
            params![
                req.farmer_id,
                req.subscription_type_id,
                today,
                end_date,
                status,
                req.auto_renew,
                now,
            ],
        )?;
        let subscription_id = SubscriptionId(tx.last_insert_rowid());

        if policy.activation == ActivationPolicy::PaymentGated {
            tx.execute(
                "INSERT INTO payments (
                    subscription_id, amount_cents, kind, status, due_date, notes, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'Awaiting initial payment', ?6)",
                params![
                    subscription_id,
                    plan.cost_cents,
                    PaymentKind::Purchase,
                    PaymentStatus::Pending,
                    today,
                    now,
                ],
            )?;
        }

        grant_basics_tx(&tx, subscription_id, now)?;

        let subscription = subscription_tx(&tx, subscription_id)?;
        tx.commit()?;
        debug!(%subscription_id, farmer_id = %req.farmer_id, "subscription created");
        Ok(subscription)
    }

    /// Fetches a subscription by id.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::SubscriptionNotFound`] for an unknown
    /// id.
    pub fn subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<FarmerSubscription, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        subscription_tx(&conn, id)
    }

    /// Lists all subscriptions for a farmer, newest first.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn subscriptions_for_farmer(
        &self,
        farmer_id: FarmerId,
    ) -> Result<Vec<FarmerSubscription>, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, farmer_id, subscription_type_id, start_date, end_date, status,
                    auto_renew, notes, created_at, updated_at
             FROM subscriptions WHERE farmer_id = ?1 ORDER BY start_date DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![farmer_id], map_subscription)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Attaches a resource to a subscription, enforcing quota inside the
    /// transaction.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::SubscriptionNotFound`] /
    ///   [`SubscriptionError::ResourceNotFound`] for unknown ids
    /// - [`SubscriptionError::BasicAutoGranted`] when attaching a basic
    ///   resource explicitly
    /// - [`SubscriptionError::PaymentRequired`] when the subscription is
    ///   still pending payment
    /// - [`SubscriptionError::Inactive`] when the subscription is not
    ///   active
    /// - [`SubscriptionError::DuplicateResource`] when the resource is
    ///   already allocated
    /// - [`SubscriptionError::LimitExceeded`] when the slot family has no
    ///   headroom
    pub fn attach_resource(
        &self,
        subscription_id: SubscriptionId,
        resource_id: ResourceId,
        quantity: u32,
        today: NaiveDate,
    ) -> Result<Allocation, SubscriptionError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let subscription = subscription_tx(&tx, subscription_id)?;
        let resource = resource_tx(&tx, resource_id)?
            .filter(|r| r.active)
            .ok_or(SubscriptionError::ResourceNotFound { id: resource_id })?;

        if resource.is_basic {
            return Err(SubscriptionError::BasicAutoGranted { resource_id });
        }
        if subscription.status == SubscriptionStatus::Pending {
            return Err(SubscriptionError::PaymentRequired { subscription_id });
        }
        if !subscription.is_active(today) {
            return Err(SubscriptionError::Inactive { subscription_id });
        }

        let rows = allocation_rows_tx(&tx, subscription_id)?;
        if rows
            .iter()
            .any(|(a, _)| a.active && a.resource_id == resource_id)
        {
            return Err(SubscriptionError::DuplicateResource {
                subscription_id,
                resource_id,
            });
        }

        let plan = subscription_type_tx(&tx, subscription.subscription_type_id)?.ok_or(
            SubscriptionError::SubscriptionTypeNotFound {
                id: subscription.subscription_type_id,
            },
        )?;
        if !entitlement::can_add(&plan, &rows, &resource) {
            return Err(SubscriptionError::LimitExceeded {
                subscription_id,
                family: resource.family(),
            });
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO allocations (subscription_id, resource_id, quantity, active, allocated_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![subscription_id, resource_id, quantity, now],
        )?;
        let allocation = Allocation {
            id: crate::ids::AllocationId(tx.last_insert_rowid()),
            subscription_id,
            resource_id,
            quantity,
            active: true,
            allocated_at: now,
        };
        tx.commit()?;
        debug!(%subscription_id, %resource_id, "resource attached");
        Ok(allocation)
    }

    /// Deactivates an allocation. The row is kept as history.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::AllocationNotFound`] if the resource
    /// has no active allocation on this subscription.
    pub fn detach_resource(
        &self,
        subscription_id: SubscriptionId,
        resource_id: ResourceId,
    ) -> Result<(), SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE allocations SET active = 0
             WHERE subscription_id = ?1 AND resource_id = ?2 AND active = 1",
            params![subscription_id, resource_id],
        )?;
        if changed == 0 {
            return Err(SubscriptionError::AllocationNotFound {
                subscription_id,
                resource_id,
            });
        }
        Ok(())
    }

    /// Cancels an active subscription: clears `auto_renew` so the expiry
    /// sweep terminates it at the end date. The row stays `ACTIVE` until
    /// then.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Inactive`] when the subscription is
    /// not `ACTIVE`.
    pub fn cancel_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<FarmerSubscription, SubscriptionError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let subscription = subscription_tx(&tx, subscription_id)?;
        if subscription.status != SubscriptionStatus::Active {
            return Err(SubscriptionError::Inactive { subscription_id });
        }
        tx.execute(
            "UPDATE subscriptions SET auto_renew = 0, updated_at = ?1 WHERE id = ?2",
            params![Utc::now(), subscription_id],
        )?;
        let subscription = subscription_tx(&tx, subscription_id)?;
        tx.commit()?;
        Ok(subscription)
    }

    /// Upgrades a subscription to a strictly higher tier.
    ///
    /// Copy-and-supersede: a new `ACTIVE` row with a one-period window
    /// starts today; active non-basic allocations are migrated best-effort
    /// under the new plan's limits; basics are re-granted; the old row is
    /// cancelled with an audit note and kept as history.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::InvalidTierTransition`] unless the new tier
    ///   is strictly higher
    /// - [`SubscriptionError::Inactive`] when the current row is not
    ///   `ACTIVE`
    /// - not-found errors for unknown ids
    pub fn upgrade_subscription(
        &self,
        subscription_id: SubscriptionId,
        new_type_id: SubscriptionTypeId,
        today: NaiveDate,
        policy: &LifecyclePolicy,
    ) -> Result<UpgradeOutcome, SubscriptionError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let subscription = subscription_tx(&tx, subscription_id)?;
        if subscription.status != SubscriptionStatus::Active {
            return Err(SubscriptionError::Inactive { subscription_id });
        }
        let current_plan = subscription_type_tx(&tx, subscription.subscription_type_id)?.ok_or(
            SubscriptionError::SubscriptionTypeNotFound {
                id: subscription.subscription_type_id,
            },
        )?;
        let new_plan = subscription_type_tx(&tx, new_type_id)?.ok_or(
            SubscriptionError::SubscriptionTypeNotFound { id: new_type_id },
        )?;
        if new_plan.tier <= current_plan.tier {
            return Err(SubscriptionError::InvalidTierTransition {
                current: current_plan.tier,
                requested: new_plan.tier,
            });
        }

        // Advisory only: computed for the response, never charged.
        let prorated_credit_cents =
            subscription.remaining_days(today) * current_plan.daily_rate_cents();

        let now = Utc::now();
        let end_date = today + Duration::days(i64::from(policy.period_days));
        tx.execute(
            "INSERT INTO subscriptions (
                farmer_id, subscription_type_id, start_date, end_date, status,
                auto_renew, notes, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, '', ?7, ?7)",
            params![
                subscription.farmer_id,
                new_type_id,
                today,
                end_date,
                SubscriptionStatus::Active,
                subscription.auto_renew,
                now,
            ],
        )?;
        let new_id = SubscriptionId(tx.last_insert_rowid());

        let old_rows = allocation_rows_tx(&tx, subscription_id)?;
        let survivors = entitlement::surviving_allocations(&new_plan, &old_rows);
        let mut migrated = Vec::with_capacity(survivors.len());
        for (allocation, resource) in &survivors {
            tx.execute(
                "INSERT INTO allocations (subscription_id, resource_id, quantity, active, allocated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![new_id, resource.id, allocation.quantity, now],
            )?;
            migrated.push(resource.id);
        }
        let skipped = old_rows
            .iter()
            .filter(|(a, r)| a.active && !r.is_basic && !migrated.contains(&r.id))
            .map(|(_, r)| r.id)
            .collect();

        grant_basics_tx(&tx, new_id, now)?;

        tx.execute(
            "UPDATE subscriptions SET status = ?1, notes = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                SubscriptionStatus::Cancelled,
                format!("Upgraded to {}", new_plan.name),
                now,
                subscription_id,
            ],
        )?;

        let new_subscription = subscription_tx(&tx, new_id)?;
        tx.commit()?;
        debug!(old = %subscription_id, new = %new_id, "subscription upgraded");
        Ok(UpgradeOutcome {
            new_subscription,
            previous_subscription_id: subscription_id,
            migrated,
            skipped,
            prorated_credit_cents,
        })
    }

    /// Applies a lifecycle state transition, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::InvalidTransition`] when the machine
    /// forbids the move.
    pub fn transition(
        &self,
        subscription_id: SubscriptionId,
        to: SubscriptionStatus,
        note: Option<&str>,
    ) -> Result<FarmerSubscription, SubscriptionError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let subscription = subscription_tx(&tx, subscription_id)?;
        if !subscription.status.can_transition_to(to) {
            return Err(SubscriptionError::InvalidTransition {
                subscription_id,
                from: subscription.status,
                to,
            });
        }
        match note {
            Some(note) => tx.execute(
                "UPDATE subscriptions SET status = ?1, notes = ?2, updated_at = ?3 WHERE id = ?4",
                params![to, note, Utc::now(), subscription_id],
            )?,
            None => tx.execute(
                "UPDATE subscriptions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![to, Utc::now(), subscription_id],
            )?,
        };
        let subscription = subscription_tx(&tx, subscription_id)?;
        tx.commit()?;
        Ok(subscription)
    }

    /// Extends a subscription's end date in place (renewal success path).
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown id.
    pub fn extend_subscription(
        &self,
        subscription_id: SubscriptionId,
        days: u32,
        today: NaiveDate,
    ) -> Result<NaiveDate, SubscriptionError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let subscription = subscription_tx(&tx, subscription_id)?;
        let new_end = subscription.end_date.unwrap_or(today) + Duration::days(i64::from(days));
        tx.execute(
            "UPDATE subscriptions SET end_date = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_end, Utc::now(), subscription_id],
        )?;
        tx.commit()?;
        Ok(new_end)
    }

    // ------------------------------------------------------------------
    // Reads for the entitlement projections
    // ------------------------------------------------------------------

    /// Active and historical allocation rows joined with their catalog
    /// resources.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn allocation_rows(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<(Allocation, Resource)>, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        allocation_rows_tx(&conn, subscription_id)
    }

    /// Resource utilization grouped by slot family.
    ///
    /// # Errors
    ///
    /// Returns not-found errors for unknown ids.
    pub fn utilization(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Utilization, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        let subscription = subscription_tx(&conn, subscription_id)?;
        let plan = subscription_type_tx(&conn, subscription.subscription_type_id)?.ok_or(
            SubscriptionError::SubscriptionTypeNotFound {
                id: subscription.subscription_type_id,
            },
        )?;
        let rows = allocation_rows_tx(&conn, subscription_id)?;
        Ok(entitlement::utilization(&plan, &rows))
    }

    /// Everything the subscription's farmer can use: all basic resources
    /// plus actively allocated ones, deduplicated.
    ///
    /// # Errors
    ///
    /// Returns not-found errors for unknown ids.
    pub fn available_resources(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<Resource>, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        // Existence check so unknown ids surface as 404 rather than [].
        subscription_tx(&conn, subscription_id)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT r.id, r.name, r.resource_type, r.category, r.unit_cost_cents,
                    r.is_basic, r.active, r.description
             FROM resources r
             LEFT JOIN allocations a
                    ON a.resource_id = r.id AND a.subscription_id = ?1 AND a.active = 1
             WHERE r.active = 1 AND (r.is_basic = 1 OR a.id IS NOT NULL)
             ORDER BY r.resource_type, r.name",
        )?;
        let rows = stmt
            .query_map(params![subscription_id], map_resource)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Sweep queries
    // ------------------------------------------------------------------

    /// `ACTIVE` subscriptions whose end date has passed.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn expired_active(
        &self,
        today: NaiveDate,
    ) -> Result<Vec<FarmerSubscription>, SubscriptionError> {
        self.select_subscriptions(
            "status = ?1 AND end_date IS NOT NULL AND end_date < ?2",
            params![SubscriptionStatus::Active, today],
        )
    }

    /// `PENDING` subscriptions with a pending payment due more than
    /// `grace_days` ago.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn overdue_pending(
        &self,
        today: NaiveDate,
        grace_days: u32,
    ) -> Result<Vec<FarmerSubscription>, SubscriptionError> {
        let cutoff = today - Duration::days(i64::from(grace_days));
        self.select_subscriptions(
            "status = ?1 AND id IN (
                SELECT subscription_id FROM payments
                WHERE status = ?2 AND due_date IS NOT NULL AND due_date < ?3
            )",
            params![
                SubscriptionStatus::Pending,
                PaymentStatus::Pending,
                cutoff
            ],
        )
    }

    /// Auto-renewing `ACTIVE` subscriptions with an end date inside the
    /// renewal window `[today - window, today + window]`.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn renewal_due(
        &self,
        today: NaiveDate,
        window_days: u32,
    ) -> Result<Vec<FarmerSubscription>, SubscriptionError> {
        let window = Duration::days(i64::from(window_days));
        self.select_subscriptions(
            "status = ?1 AND auto_renew = 1
             AND end_date IS NOT NULL AND end_date >= ?2 AND end_date <= ?3",
            params![SubscriptionStatus::Active, today - window, today + window],
        )
    }

    /// `ACTIVE` subscriptions ending within `days` (reminder sweep; both
    /// auto-renew and manual).
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn expiring_soon(
        &self,
        today: NaiveDate,
        days: u32,
    ) -> Result<Vec<FarmerSubscription>, SubscriptionError> {
        self.select_subscriptions(
            "status = ?1 AND end_date IS NOT NULL AND end_date >= ?2 AND end_date <= ?3",
            params![
                SubscriptionStatus::Active,
                today,
                today + Duration::days(i64::from(days))
            ],
        )
    }

    fn select_subscriptions(
        &self,
        predicate: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<FarmerSubscription>, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, farmer_id, subscription_type_id, start_date, end_date, status,
                    auto_renew, notes, created_at, updated_at
             FROM subscriptions WHERE {predicate} ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, map_subscription)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------

    /// Records a payment.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn create_payment(&self, new: &NewPayment) -> Result<Payment, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO payments (
                subscription_id, amount_cents, kind, status, due_date, period_end, notes, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.subscription_id,
                new.amount_cents,
                new.kind,
                new.status,
                new.due_date,
                new.period_end,
                new.notes,
                now,
            ],
        )?;
        let id = PaymentId(conn.last_insert_rowid());
        payment_tx(&conn, id)
    }

    /// Fetches a payment by id.
    ///
    /// # Errors
    ///
    /// Returns a database error if the payment does not exist.
    pub fn payment(&self, id: PaymentId) -> Result<Payment, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        payment_tx(&conn, id)
    }

    /// Marks a payment `COMPLETED` with its gateway transaction id.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn complete_payment(
        &self,
        id: PaymentId,
        transaction_id: &str,
    ) -> Result<Payment, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE payments SET status = ?1, transaction_id = ?2, paid_at = ?3,
                    notes = 'Payment processed successfully'
             WHERE id = ?4",
            params![PaymentStatus::Completed, transaction_id, Utc::now(), id],
        )?;
        payment_tx(&conn, id)
    }

    /// Marks a payment `FAILED` with a reason.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn fail_payment(&self, id: PaymentId, reason: &str) -> Result<(), SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE payments SET status = ?1, notes = ?2 WHERE id = ?3",
            params![PaymentStatus::Failed, format!("Payment failed: {reason}"), id],
        )?;
        Ok(())
    }

    /// Increments a payment's replay counter and stamps the attempt time.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn bump_retry(&self, id: PaymentId) -> Result<u32, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE payments SET retry_count = retry_count + 1, last_retry_at = ?1 WHERE id = ?2",
            params![Utc::now(), id],
        )?;
        let count = conn.query_row(
            "SELECT retry_count FROM payments WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// `FAILED` payments created since `cutoff` with fewer than
    /// `max_retries` replay attempts, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn failed_payments_since(
        &self,
        cutoff: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<Vec<Payment>, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, subscription_id, amount_cents, kind, status, due_date, period_end,
                    transaction_id, paid_at, retry_count, last_retry_at, notes, created_at
             FROM payments
             WHERE status = ?1 AND created_at >= ?2 AND retry_count < ?3
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(
                params![PaymentStatus::Failed, cutoff, max_retries],
                map_payment,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The `COMPLETED` renewal payment already covering the billing
    /// period ending at `period_end`, if any. The retry coordinator
    /// checks this before charging so a replayed task cannot
    /// double-charge.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn completed_renewal(
        &self,
        subscription_id: SubscriptionId,
        period_end: NaiveDate,
    ) -> Result<Option<Payment>, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT id, subscription_id, amount_cents, kind, status, due_date, period_end,
                        transaction_id, paid_at, retry_count, last_retry_at, notes, created_at
                 FROM payments
                 WHERE subscription_id = ?1 AND kind = ?2 AND status = ?3 AND period_end = ?4
                 LIMIT 1",
                params![
                    subscription_id,
                    PaymentKind::Renewal,
                    PaymentStatus::Completed,
                    period_end
                ],
                map_payment,
            )
            .optional()?)
    }

    /// All payments for a subscription, newest first.
    ///
    /// # Errors
    ///
    /// Returns a database error on storage failure.
    pub fn payments_for_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<Payment>, SubscriptionError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, subscription_id, amount_cents, kind, status, due_date, period_end,
                    transaction_id, paid_at, retry_count, last_retry_at, notes, created_at
             FROM payments WHERE subscription_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map(params![subscription_id], map_payment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl Catalog for Store {
    fn subscription_type(
        &self,
        id: SubscriptionTypeId,
    ) -> Result<Option<SubscriptionType>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        Ok(subscription_type_tx(&conn, id)?)
    }

    fn subscription_types(&self) -> Result<Vec<SubscriptionType>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, tier, farm_size, cost_cents, max_hardware_nodes,
                    max_software_services, includes_predictions, includes_analytics, description
             FROM subscription_types ORDER BY tier, name",
        )?;
        let rows = stmt
            .query_map([], map_subscription_type)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn resource(&self, id: ResourceId) -> Result<Option<Resource>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        resource_tx(&conn, id)
    }

    fn resources(&self) -> Result<Vec<Resource>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, resource_type, category, unit_cost_cents, is_basic, active, description
             FROM resources WHERE active = 1 ORDER BY resource_type, name",
        )?;
        let rows = stmt
            .query_map([], map_resource)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn basic_resources(&self) -> Result<Vec<Resource>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, resource_type, category, unit_cost_cents, is_basic, active, description
             FROM resources WHERE active = 1 AND is_basic = 1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], map_resource)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ----------------------------------------------------------------------
// Row mapping and shared per-connection helpers
// ----------------------------------------------------------------------

fn map_subscription_type(row: &Row<'_>) -> rusqlite::Result<SubscriptionType> {
    Ok(SubscriptionType {
        id: row.get(0)?,
        name: row.get(1)?,
        tier: row.get(2)?,
        farm_size: row.get(3)?,
        cost_cents: row.get(4)?,
        max_hardware_nodes: row.get(5)?,
        max_software_services: row.get(6)?,
        includes_predictions: row.get(7)?,
        includes_analytics: row.get(8)?,
        description: row.get(9)?,
    })
}

fn map_resource(row: &Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        id: row.get(0)?,
        name: row.get(1)?,
        resource_type: row.get(2)?,
        category: row.get(3)?,
        unit_cost_cents: row.get(4)?,
        is_basic: row.get(5)?,
        active: row.get(6)?,
        description: row.get(7)?,
    })
}

fn map_subscription(row: &Row<'_>) -> rusqlite::Result<FarmerSubscription> {
    Ok(FarmerSubscription {
        id: row.get(0)?,
        farmer_id: row.get(1)?,
        subscription_type_id: row.get(2)?,
        start_date: row.get(3)?,
        end_date: row.get(4)?,
        status: row.get(5)?,
        auto_renew: row.get(6)?,
        notes: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn map_allocation(row: &Row<'_>) -> rusqlite::Result<Allocation> {
    Ok(Allocation {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        resource_id: row.get(2)?,
        quantity: row.get(3)?,
        active: row.get(4)?,
        allocated_at: row.get(5)?,
    })
}

fn map_payment(row: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        amount_cents: row.get(2)?,
        kind: row.get(3)?,
        status: row.get(4)?,
        due_date: row.get(5)?,
        period_end: row.get(6)?,
        transaction_id: row.get(7)?,
        paid_at: row.get(8)?,
        retry_count: row.get(9)?,
        last_retry_at: row.get(10)?,
        notes: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn subscription_tx(
    conn: &Connection,
    id: SubscriptionId,
) -> Result<FarmerSubscription, SubscriptionError> {
    conn.query_row(
        "SELECT id, farmer_id, subscription_type_id, start_date, end_date, status,
                auto_renew, notes, created_at, updated_at
         FROM subscriptions WHERE id = ?1",
        params![id],
        map_subscription,
    )
    .optional()?
    .ok_or(SubscriptionError::SubscriptionNotFound { id })
}

fn subscription_type_tx(
    conn: &Connection,
    id: SubscriptionTypeId,
) -> Result<Option<SubscriptionType>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, name, tier, farm_size, cost_cents, max_hardware_nodes,
                max_software_services, includes_predictions, includes_analytics, description
         FROM subscription_types WHERE id = ?1",
        params![id],
        map_subscription_type,
    )
    .optional()
}

fn resource_tx(conn: &Connection, id: ResourceId) -> Result<Option<Resource>, CatalogError> {
    Ok(conn
        .query_row(
            "SELECT id, name, resource_type, category, unit_cost_cents, is_basic, active, description
             FROM resources WHERE id = ?1",
            params![id],
            map_resource,
        )
        .optional()?)
}

fn allocation_rows_tx(
    conn: &Connection,
    subscription_id: SubscriptionId,
) -> Result<Vec<(Allocation, Resource)>, SubscriptionError> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.subscription_id, a.resource_id, a.quantity, a.active, a.allocated_at,
                r.id, r.name, r.resource_type, r.category, r.unit_cost_cents,
                r.is_basic, r.active, r.description
         FROM allocations a
         JOIN resources r ON r.id = a.resource_id
         WHERE a.subscription_id = ?1
         ORDER BY a.id",
    )?;
    let rows = stmt
        .query_map(params![subscription_id], |row| {
            let allocation = map_allocation(row)?;
            let resource = Resource {
                id: row.get(6)?,
                name: row.get(7)?,
                resource_type: row.get(8)?,
                category: row.get(9)?,
                unit_cost_cents: row.get(10)?,
                is_basic: row.get(11)?,
                active: row.get(12)?,
                description: row.get(13)?,
            };
            Ok((allocation, resource))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn payment_tx(conn: &Connection, id: PaymentId) -> Result<Payment, SubscriptionError> {
    Ok(conn.query_row(
        "SELECT id, subscription_id, amount_cents, kind, status, due_date, period_end,
                transaction_id, paid_at, retry_count, last_retry_at, notes, created_at
         FROM payments WHERE id = ?1",
        params![id],
        map_payment,
    )?)
}

fn grant_basics_tx(
    conn: &Connection,
    subscription_id: SubscriptionId,
    now: DateTime<Utc>,
) -> Result<(), SubscriptionError> {
    let mut stmt = conn.prepare("SELECT id FROM resources WHERE active = 1 AND is_basic = 1")?;
    let basics = stmt
        .query_map([], |row| row.get::<_, ResourceId>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for resource_id in basics {
        conn.execute(
            "INSERT INTO allocations (subscription_id, resource_id, quantity, active, allocated_at)
             VALUES (?1, ?2, 1, 1, ?3)",
            params![subscription_id, resource_id, now],
        )?;
    }
    Ok(())
}
