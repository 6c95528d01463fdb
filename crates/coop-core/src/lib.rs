//! coop-core - Subscription Lifecycle & Resource Entitlement Engine
//!
//! This library implements the subscription engine for a poultry
//! farm-management platform: tiered subscription plans, hardware/software
//! resource quotas, lifecycle state transitions, and the background sweeps
//! that renew, expire, and suspend subscriptions.
//!
//! # Architecture
//!
//! - [`catalog`]: Read-mostly reference data - subscription types (tiers)
//!   and purchasable resources, behind the [`catalog::Catalog`] trait so
//!   tests can substitute an in-memory catalog.
//! - [`subscription`]: The ledger entities - subscriptions, allocations,
//!   payments - and the subscription status state machine.
//! - [`entitlement`]: Pure quota logic - utilization, admission checks,
//!   and upgrade survival - over in-memory rows.
//! - [`store`]: `SQLite`-backed persistence. All check-then-act sequences
//!   (quota check + allocation insert, tier check + supersede) run inside a
//!   single immediate transaction so concurrent writers cannot race past a
//!   quota check.
//! - [`lifecycle`]: The lifecycle service and scheduled sweeps (expiry,
//!   suspension, reminders, renewals).
//! - [`billing`]: Payment coordinator with bounded linear-backoff retries
//!   and a failed-payment replay sweep.
//! - [`notify`]: Notification fan-out trait; production wires a tracing
//!   sink, tests record.
//! - [`config`]: TOML configuration for the daemon, scheduler cadence, and
//!   retry policy.
//!
//! # Concurrency model
//!
//! There is no in-process coordination beyond the store: the API tier and
//! the background scheduler both mutate the same tables. Every lifecycle
//! transition for a subscription is serialized by the store's connection
//! lock plus an immediate transaction, which closes the double-allocation
//! race a naive read-check-write sequence would have.

pub mod billing;
pub mod catalog;
pub mod config;
pub mod entitlement;
pub mod ids;
pub mod lifecycle;
pub mod notify;
pub mod store;
pub mod subscription;
