//! Pure entitlement logic: utilization, admission checks, upgrade
//! survival.
//!
//! Everything here is a function of in-memory rows; the store joins
//! allocations with their catalog resources and delegates the decisions
//! to this module inside its transactions.

use serde::{Deserialize, Serialize};

use crate::catalog::{Resource, SlotFamily, SubscriptionType};
use crate::subscription::Allocation;

/// Usage of one quota slot family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotUsage {
    /// Active, non-basic allocations counted against this family.
    pub used: u32,
    /// The plan's limit for this family.
    pub limit: u32,
    /// Remaining headroom (`limit - used`, floored at zero).
    pub available: u32,
}

impl SlotUsage {
    /// Builds a usage record, deriving `available`.
    #[must_use]
    pub const fn new(used: u32, limit: u32) -> Self {
        Self {
            used,
            limit,
            available: limit.saturating_sub(used),
        }
    }
}

/// Resource utilization of a subscription, grouped by slot family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utilization {
    /// Hardware slot usage.
    pub hardware: SlotUsage,
    /// Software-family slot usage (SOFTWARE, PREDICTION, and ANALYTICS
    /// collapsed).
    pub software: SlotUsage,
}

impl Utilization {
    /// Usage for the given family.
    #[must_use]
    pub const fn family(&self, family: SlotFamily) -> SlotUsage {
        match family {
            SlotFamily::Hardware => self.hardware,
            SlotFamily::Software => self.software,
        }
    }
}

/// Computes utilization from the subscription's allocation rows joined
/// with their catalog resources.
///
/// Only active allocations of non-basic resources count; each allocation
/// row counts once regardless of quantity, matching how limits are
/// defined (number of distinct nodes/services, not units).
#[must_use]
pub fn utilization(plan: &SubscriptionType, rows: &[(Allocation, Resource)]) -> Utilization {
    let mut hardware = 0u32;
    let mut software = 0u32;
    for (allocation, resource) in rows {
        if !allocation.active || resource.is_basic {
            continue;
        }
        match resource.family() {
            SlotFamily::Hardware => hardware += 1,
            SlotFamily::Software => software += 1,
        }
    }
    Utilization {
        hardware: SlotUsage::new(hardware, plan.max_hardware_nodes),
        software: SlotUsage::new(software, plan.max_software_services),
    }
}

/// Whether `candidate` may be added to a subscription with the given plan
/// and allocation rows.
///
/// Basic resources are always admitted (they are quota-exempt);
/// otherwise the candidate's slot family must have headroom.
#[must_use]
pub fn can_add(
    plan: &SubscriptionType,
    rows: &[(Allocation, Resource)],
    candidate: &Resource,
) -> bool {
    if candidate.is_basic {
        return true;
    }
    utilization(plan, rows).family(candidate.family()).available > 0
}

/// Selects the active, non-basic allocations that survive a move to
/// `new_plan`, in allocation order.
///
/// Transfer is best-effort: an allocation that would overflow the new
/// plan's family limit is skipped rather than failing the upgrade. With a
/// strictly higher tier this should not happen, but the catalog does not
/// guarantee monotone limits.
#[must_use]
pub fn surviving_allocations<'a>(
    new_plan: &SubscriptionType,
    rows: &'a [(Allocation, Resource)],
) -> Vec<&'a (Allocation, Resource)> {
    let mut hardware = 0u32;
    let mut software = 0u32;
    let mut survivors = Vec::new();
    for row in rows {
        let (allocation, resource) = row;
        if !allocation.active || resource.is_basic {
            continue;
        }
        match resource.family() {
            SlotFamily::Hardware if hardware < new_plan.max_hardware_nodes => {
                hardware += 1;
                survivors.push(row);
            }
            SlotFamily::Software if software < new_plan.max_software_services => {
                software += 1;
                survivors.push(row);
            }
            _ => {}
        }
    }
    survivors
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::catalog::{NewResource, ResourceCategory, ResourceType, Tier};
    use crate::ids::{AllocationId, ResourceId, SubscriptionId, SubscriptionTypeId};

    use super::*;

    fn plan(max_hw: u32, max_sw: u32) -> SubscriptionType {
        SubscriptionType {
            id: SubscriptionTypeId(1),
            name: "Normal".into(),
            tier: Tier::Normal,
            farm_size: "Medium".into(),
            cost_cents: 3_000,
            max_hardware_nodes: max_hw,
            max_software_services: max_sw,
            includes_predictions: true,
            includes_analytics: false,
            description: String::new(),
        }
    }

    fn resource(id: i64, resource_type: ResourceType, is_basic: bool) -> Resource {
        Resource {
            id: ResourceId(id),
            name: format!("res-{id}"),
            resource_type,
            category: ResourceCategory::Inventory,
            unit_cost_cents: 100,
            is_basic,
            active: true,
            description: String::new(),
        }
    }

    fn allocated(resource: Resource, active: bool) -> (Allocation, Resource) {
        (
            Allocation {
                id: AllocationId(resource.id.0),
                subscription_id: SubscriptionId(1),
                resource_id: resource.id,
                quantity: 1,
                active,
                allocated_at: Utc::now(),
            },
            resource,
        )
    }

    #[test]
    fn utilization_groups_by_family_and_skips_basic_and_inactive() {
        let rows = vec![
            allocated(resource(1, ResourceType::Hardware, false), true),
            allocated(resource(2, ResourceType::Hardware, true), true), // basic
            allocated(resource(3, ResourceType::Software, false), true),
            allocated(resource(4, ResourceType::Prediction, false), true),
            allocated(resource(5, ResourceType::Analytics, false), false), // inactive
        ];
        let util = utilization(&plan(3, 4), &rows);

        assert_eq!(util.hardware, SlotUsage::new(1, 3));
        assert_eq!(util.software, SlotUsage::new(2, 4));
        assert_eq!(util.hardware.available, 2);
        assert_eq!(util.software.available, 2);
    }

    #[test]
    fn utilization_available_floors_at_zero() {
        let rows = vec![
            allocated(resource(1, ResourceType::Hardware, false), true),
            allocated(resource(2, ResourceType::Hardware, false), true),
        ];
        let util = utilization(&plan(1, 1), &rows);
        assert_eq!(util.hardware.used, 2);
        assert_eq!(util.hardware.available, 0);
    }

    #[test]
    fn basic_resource_is_always_admitted() {
        let rows = vec![allocated(resource(1, ResourceType::Hardware, false), true)];
        let basic = resource(9, ResourceType::Hardware, true);
        assert!(can_add(&plan(1, 1), &rows, &basic));
    }

    #[test]
    fn can_add_denies_exhausted_family_only() {
        let rows = vec![allocated(resource(1, ResourceType::Hardware, false), true)];
        let p = plan(1, 1);

        assert!(!can_add(&p, &rows, &resource(2, ResourceType::Hardware, false)));
        assert!(can_add(&p, &rows, &resource(3, ResourceType::Software, false)));
        assert!(can_add(&p, &rows, &resource(4, ResourceType::Prediction, false)));
    }

    #[test]
    fn surviving_allocations_skips_overflow_per_family() {
        let rows = vec![
            allocated(resource(1, ResourceType::Hardware, false), true),
            allocated(resource(2, ResourceType::Hardware, false), true),
            allocated(resource(3, ResourceType::Software, false), true),
            allocated(resource(4, ResourceType::Hardware, true), true), // basic: re-granted, not copied
            allocated(resource(5, ResourceType::Analytics, false), false), // inactive: dropped
        ];
        let survivors = surviving_allocations(&plan(1, 2), &rows);
        let ids: Vec<i64> = survivors.iter().map(|(a, _)| a.resource_id.0).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
