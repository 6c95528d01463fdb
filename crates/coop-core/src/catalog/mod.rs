//! Entitlement catalog: subscription tiers and purchasable resources.
//!
//! Catalog rows are admin-managed, read-mostly reference data. Everything
//! that needs catalog lookups goes through the [`Catalog`] trait rather
//! than a shared global table, so the engine can be exercised against an
//! [`MemoryCatalog`] in tests.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ResourceId, SubscriptionTypeId};

mod memory;

pub use memory::MemoryCatalog;

/// Days in one billing period. Plan costs are quoted per period; the
/// prorated upgrade credit divides by this.
pub const PERIOD_DAYS: i64 = 30;

/// Errors from catalog lookups.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// Underlying storage failed.
    #[error("catalog storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

macro_rules! text_enum_sql {
    ($name:ident) => {
        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                Self::parse(raw).ok_or_else(|| {
                    FromSqlError::Other(
                        format!("unknown {} value: {raw}", stringify!($name)).into(),
                    )
                })
            }
        }
    };
}
pub(crate) use text_enum_sql;

/// Ordered subscription rank. The ordering is total and strict:
/// `Individual < Normal < Premium`. Upgrades require a strictly higher
/// tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    /// Individual/small farm.
    Individual,
    /// Normal/medium farm.
    Normal,
    /// Premium/large farm.
    Premium,
}

impl Tier {
    /// Numeric rank used for ordering comparisons in logs and payloads.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Individual => 0,
            Self::Normal => 1,
            Self::Premium => 2,
        }
    }

    /// Canonical string form, as stored and serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Individual => "INDIVIDUAL",
            Self::Normal => "NORMAL",
            Self::Premium => "PREMIUM",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "INDIVIDUAL" => Some(Self::Individual),
            "NORMAL" => Some(Self::Normal),
            "PREMIUM" => Some(Self::Premium),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

text_enum_sql!(Tier);

/// The two quota slot families a subscription type bounds.
///
/// `SOFTWARE`, `PREDICTION`, and `ANALYTICS` resources are budget-fungible:
/// they all draw from the software slot budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotFamily {
    /// Physical nodes (feeders, sensors, ...), bounded by
    /// `max_hardware_nodes`.
    Hardware,
    /// Software-family services, bounded by `max_software_services`.
    Software,
}

impl SlotFamily {
    /// Human-readable family name used in error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Software => "software",
        }
    }
}

impl std::fmt::Display for SlotFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of catalog resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    /// Physical hardware node.
    Hardware,
    /// Software service.
    Software,
    /// Prediction service (software slot).
    Prediction,
    /// Analytics service (software slot).
    Analytics,
}

impl ResourceType {
    /// The quota family this resource type draws from.
    #[must_use]
    pub const fn family(self) -> SlotFamily {
        match self {
            Self::Hardware => SlotFamily::Hardware,
            Self::Software | Self::Prediction | Self::Analytics => SlotFamily::Software,
        }
    }

    /// Canonical string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hardware => "HARDWARE",
            Self::Software => "SOFTWARE",
            Self::Prediction => "PREDICTION",
            Self::Analytics => "ANALYTICS",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "HARDWARE" => Some(Self::Hardware),
            "SOFTWARE" => Some(Self::Software),
            "PREDICTION" => Some(Self::Prediction),
            "ANALYTICS" => Some(Self::Analytics),
            _ => None,
        }
    }
}

text_enum_sql!(ResourceType);

/// Functional category of a resource (what the node or service does on
/// the farm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceCategory {
    /// Feeding node.
    Feeding,
    /// Thermal node.
    Thermal,
    /// Watering node.
    Watering,
    /// Weighting node.
    Weighting,
    /// Dusting node.
    Dusting,
    /// Prediction service.
    Prediction,
    /// Analytics service.
    Analytics,
    /// Inventory management.
    Inventory,
}

impl ResourceCategory {
    /// Canonical string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Feeding => "FEEDING",
            Self::Thermal => "THERMAL",
            Self::Watering => "WATERING",
            Self::Weighting => "WEIGHTING",
            Self::Dusting => "DUSTING",
            Self::Prediction => "PREDICTION",
            Self::Analytics => "ANALYTICS",
            Self::Inventory => "INVENTORY",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "FEEDING" => Some(Self::Feeding),
            "THERMAL" => Some(Self::Thermal),
            "WATERING" => Some(Self::Watering),
            "WEIGHTING" => Some(Self::Weighting),
            "DUSTING" => Some(Self::Dusting),
            "PREDICTION" => Some(Self::Prediction),
            "ANALYTICS" => Some(Self::Analytics),
            "INVENTORY" => Some(Self::Inventory),
            _ => None,
        }
    }
}

text_enum_sql!(ResourceCategory);

/// A catalog subscription type (plan).
///
/// Immutable once referenced by an active subscription, except through
/// admin tooling; never deleted while referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionType {
    /// Catalog id.
    pub id: SubscriptionTypeId,
    /// Unique plan name.
    pub name: String,
    /// Ordered tier this plan sits at.
    pub tier: Tier,
    /// Farm size label (advisory, e.g. "Small").
    pub farm_size: String,
    /// Cost per billing period, in cents.
    pub cost_cents: i64,
    /// Maximum active non-basic hardware allocations.
    pub max_hardware_nodes: u32,
    /// Maximum active non-basic software-family allocations.
    pub max_software_services: u32,
    /// Whether the plan includes prediction services.
    pub includes_predictions: bool,
    /// Whether the plan includes analytics services.
    pub includes_analytics: bool,
    /// Free-form description.
    pub description: String,
}

impl SubscriptionType {
    /// Cost per day in cents, used for the advisory prorated upgrade
    /// credit.
    #[must_use]
    pub const fn daily_rate_cents(&self) -> i64 {
        self.cost_cents / PERIOD_DAYS
    }
}

/// Input for creating a catalog subscription type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscriptionType {
    /// Unique plan name.
    pub name: String,
    /// Tier.
    pub tier: Tier,
    /// Farm size label.
    pub farm_size: String,
    /// Cost per billing period, in cents.
    pub cost_cents: i64,
    /// Hardware slot limit.
    pub max_hardware_nodes: u32,
    /// Software-family slot limit.
    pub max_software_services: u32,
    /// Plan includes predictions.
    pub includes_predictions: bool,
    /// Plan includes analytics.
    pub includes_analytics: bool,
    /// Description.
    pub description: String,
}

/// A catalog resource a farmer can attach to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Catalog id.
    pub id: ResourceId,
    /// Unique resource name.
    pub name: String,
    /// Kind of resource; determines the quota family.
    pub resource_type: ResourceType,
    /// Functional category.
    pub category: ResourceCategory,
    /// Cost per unit, in cents.
    pub unit_cost_cents: i64,
    /// Basic resources are granted to every subscription unconditionally
    /// and never count against quota.
    pub is_basic: bool,
    /// Inactive resources are hidden from the catalog and cannot be
    /// attached.
    pub active: bool,
    /// Free-form description.
    pub description: String,
}

impl Resource {
    /// The quota family this resource draws from.
    #[must_use]
    pub const fn family(&self) -> SlotFamily {
        self.resource_type.family()
    }
}

/// Input for creating a catalog resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResource {
    /// Unique resource name.
    pub name: String,
    /// Kind of resource.
    pub resource_type: ResourceType,
    /// Functional category.
    pub category: ResourceCategory,
    /// Cost per unit, in cents.
    pub unit_cost_cents: i64,
    /// Granted to every subscription, exempt from quota.
    pub is_basic: bool,
    /// Visible and attachable.
    pub active: bool,
    /// Description.
    pub description: String,
}

/// Read-through catalog repository.
///
/// The store implements this over `SQLite`; [`MemoryCatalog`] implements
/// it over plain vectors for tests.
pub trait Catalog: Send + Sync {
    /// Looks up a subscription type by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn subscription_type(
        &self,
        id: SubscriptionTypeId,
    ) -> Result<Option<SubscriptionType>, CatalogError>;

    /// Lists all subscription types, ordered by tier then name.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn subscription_types(&self) -> Result<Vec<SubscriptionType>, CatalogError>;

    /// Looks up a resource by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn resource(&self, id: ResourceId) -> Result<Option<Resource>, CatalogError>;

    /// Lists all active resources, ordered by type then name.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn resources(&self) -> Result<Vec<Resource>, CatalogError>;

    /// Lists all active basic resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn basic_resources(&self) -> Result<Vec<Resource>, CatalogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_is_strict_and_total() {
        assert!(Tier::Individual < Tier::Normal);
        assert!(Tier::Normal < Tier::Premium);
        assert!(Tier::Individual < Tier::Premium);
        assert_eq!(Tier::Normal, Tier::Normal);
        assert_eq!(Tier::Premium.rank(), 2);
    }

    #[test]
    fn tier_round_trips_through_text() {
        for tier in [Tier::Individual, Tier::Normal, Tier::Premium] {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(Tier::parse("PLATINUM"), None);
    }

    #[test]
    fn software_family_collapses_prediction_and_analytics() {
        assert_eq!(ResourceType::Hardware.family(), SlotFamily::Hardware);
        assert_eq!(ResourceType::Software.family(), SlotFamily::Software);
        assert_eq!(ResourceType::Prediction.family(), SlotFamily::Software);
        assert_eq!(ResourceType::Analytics.family(), SlotFamily::Software);
    }

    #[test]
    fn daily_rate_divides_period_cost() {
        let plan = SubscriptionType {
            id: SubscriptionTypeId(1),
            name: "Normal".into(),
            tier: Tier::Normal,
            farm_size: "Medium".into(),
            cost_cents: 3_000,
            max_hardware_nodes: 3,
            max_software_services: 3,
            includes_predictions: false,
            includes_analytics: false,
            description: String::new(),
        };
        assert_eq!(plan.daily_rate_cents(), 100);
    }

    #[test]
    fn memory_catalog_filters_and_orders_like_the_store() {
        let catalog = MemoryCatalog::new();
        let premium = catalog.add_subscription_type(NewSubscriptionType {
            name: "Premium".into(),
            tier: Tier::Premium,
            farm_size: "Large".into(),
            cost_cents: 30_000,
            max_hardware_nodes: 5,
            max_software_services: 5,
            includes_predictions: true,
            includes_analytics: true,
            description: String::new(),
        });
        let individual = catalog.add_subscription_type(NewSubscriptionType {
            name: "Individual".into(),
            tier: Tier::Individual,
            farm_size: "Small".into(),
            cost_cents: 5_000,
            max_hardware_nodes: 1,
            max_software_services: 1,
            includes_predictions: false,
            includes_analytics: false,
            description: String::new(),
        });
        let tracker = catalog.add_resource(NewResource {
            name: "Inventory Tracker".into(),
            resource_type: ResourceType::Software,
            category: ResourceCategory::Inventory,
            unit_cost_cents: 0,
            is_basic: true,
            active: true,
            description: String::new(),
        });
        catalog.add_resource(NewResource {
            name: "Legacy Probe".into(),
            resource_type: ResourceType::Hardware,
            category: ResourceCategory::Feeding,
            unit_cost_cents: 1_000,
            is_basic: false,
            active: false,
            description: String::new(),
        });

        // Tier order, not insertion order.
        let types = catalog.subscription_types().unwrap();
        assert_eq!(types[0].id, individual);
        assert_eq!(types[1].id, premium);
        assert!(catalog
            .subscription_type(SubscriptionTypeId(99))
            .unwrap()
            .is_none());

        // Inactive resources are hidden from listings.
        let resources = catalog.resources().unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].id, tracker);
        let basics = catalog.basic_resources().unwrap();
        assert_eq!(basics.len(), 1);
    }
}
