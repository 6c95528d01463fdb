//! In-memory catalog for tests and fixtures.

// RwLock poisoning indicates a panic in another thread, which is
// unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::sync::RwLock;

use crate::ids::{ResourceId, SubscriptionTypeId};

use super::{
    Catalog, CatalogError, NewResource, NewSubscriptionType, Resource, SubscriptionType,
};

/// A [`Catalog`] backed by plain vectors.
///
/// Ids are assigned sequentially on insert. Intended for tests; the
/// production catalog lives in the store.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    types: Vec<SubscriptionType>,
    resources: Vec<Resource>,
}

impl MemoryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription type and returns its id.
    pub fn add_subscription_type(&self, new: NewSubscriptionType) -> SubscriptionTypeId {
        let mut inner = self.inner.write().unwrap();
        let id = SubscriptionTypeId(inner.types.len() as i64 + 1);
        inner.types.push(SubscriptionType {
            id,
            name: new.name,
            tier: new.tier,
            farm_size: new.farm_size,
            cost_cents: new.cost_cents,
            max_hardware_nodes: new.max_hardware_nodes,
            max_software_services: new.max_software_services,
            includes_predictions: new.includes_predictions,
            includes_analytics: new.includes_analytics,
            description: new.description,
        });
        id
    }

    /// Adds a resource and returns its id.
    pub fn add_resource(&self, new: NewResource) -> ResourceId {
        let mut inner = self.inner.write().unwrap();
        let id = ResourceId(inner.resources.len() as i64 + 1);
        inner.resources.push(Resource {
            id,
            name: new.name,
            resource_type: new.resource_type,
            category: new.category,
            unit_cost_cents: new.unit_cost_cents,
            is_basic: new.is_basic,
            active: new.active,
            description: new.description,
        });
        id
    }
}

impl Catalog for MemoryCatalog {
    fn subscription_type(
        &self,
        id: SubscriptionTypeId,
    ) -> Result<Option<SubscriptionType>, CatalogError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.types.iter().find(|t| t.id == id).cloned())
    }

    fn subscription_types(&self) -> Result<Vec<SubscriptionType>, CatalogError> {
        let inner = self.inner.read().unwrap();
        let mut types = inner.types.clone();
        types.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)));
        Ok(types)
    }

    fn resource(&self, id: ResourceId) -> Result<Option<Resource>, CatalogError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.resources.iter().find(|r| r.id == id).cloned())
    }

    fn resources(&self) -> Result<Vec<Resource>, CatalogError> {
        let inner = self.inner.read().unwrap();
        let mut resources: Vec<_> =
            inner.resources.iter().filter(|r| r.active).cloned().collect();
        resources.sort_by(|a, b| {
            a.resource_type
                .as_str()
                .cmp(b.resource_type.as_str())
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(resources)
    }

    fn basic_resources(&self) -> Result<Vec<Resource>, CatalogError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .resources
            .iter()
            .filter(|r| r.active && r.is_basic)
            .cloned()
            .collect())
    }
}
