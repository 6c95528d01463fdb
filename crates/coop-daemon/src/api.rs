//! HTTP API for the subscription engine.
//!
//! Thin layer over [`Lifecycle`] and the store: handlers translate JSON
//! requests into service calls and map [`SubscriptionError`] onto the
//! wire contract, a `{"detail", "code"}` body with the status implied by
//! the machine code.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use coop_core::catalog::Catalog;
use coop_core::ids::{FarmerId, ResourceId, SubscriptionId, SubscriptionTypeId};
use coop_core::lifecycle::Lifecycle;
use coop_core::store::{CreateSubscription, Store};
use coop_core::subscription::SubscriptionError;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Lifecycle service (request-path operations).
    pub lifecycle: Arc<Lifecycle>,
    /// Store, for reads not mediated by the lifecycle.
    pub store: Arc<Store>,
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/subscription-types", get(list_subscription_types))
        .route("/resources", get(list_resources))
        .route("/subscriptions", post(create_subscription))
        .route("/subscriptions/:id", get(get_subscription))
        .route("/subscriptions/:id/upgrade", post(upgrade_subscription))
        .route("/subscriptions/:id/cancel", post(cancel_subscription))
        .route(
            "/subscriptions/:id/resources",
            get(available_resources).post(attach_resource),
        )
        .route(
            "/subscriptions/:id/resources/:resource_id",
            delete(detach_resource),
        )
        .route("/subscriptions/:id/utilization", get(utilization))
        .route("/subscriptions/:id/payments", get(list_payments))
        .route("/farmers/:id/subscriptions", get(farmer_subscriptions))
        .with_state(state)
}

/// API error: a [`SubscriptionError`] plus its wire mapping.
pub struct ApiError(SubscriptionError);

impl From<SubscriptionError> for ApiError {
    fn from(err: SubscriptionError) -> Self {
        Self(err)
    }
}

impl From<coop_core::catalog::CatalogError> for ApiError {
    fn from(err: coop_core::catalog::CatalogError) -> Self {
        Self(SubscriptionError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let (status, detail) = match &self.0 {
            err if err.is_not_found() => (StatusCode::NOT_FOUND, err.to_string()),
            SubscriptionError::PaymentRequired { .. } => {
                (StatusCode::PAYMENT_REQUIRED, self.0.to_string())
            }
            SubscriptionError::Catalog(_) | SubscriptionError::Database(_) => {
                error!(error = %self.0, "internal error serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            err => (StatusCode::BAD_REQUEST, err.to_string()),
        };
        (status, Json(json!({ "detail": detail, "code": code }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CreateSubscriptionBody {
    farmer_id: FarmerId,
    subscription_type_id: SubscriptionTypeId,
    #[serde(default = "default_duration_months")]
    duration_months: u32,
    #[serde(default = "default_auto_renew")]
    auto_renew: bool,
}

const fn default_duration_months() -> u32 {
    1
}

const fn default_auto_renew() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct UpgradeBody {
    new_subscription_type_id: SubscriptionTypeId,
}

#[derive(Debug, Deserialize)]
struct AttachBody {
    resource_id: ResourceId,
    #[serde(default = "default_quantity")]
    quantity: u32,
}

const fn default_quantity() -> u32 {
    1
}

async fn list_subscription_types(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.subscription_types()?))
}

async fn list_resources(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.resources()?))
}

async fn create_subscription(
    State(state): State<AppState>,
    Json(body): Json<CreateSubscriptionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let subscription = state.lifecycle.create_subscription(
        &CreateSubscription {
            farmer_id: body.farmer_id,
            subscription_type_id: body.subscription_type_id,
            duration_months: body.duration_months,
            auto_renew: body.auto_renew,
        },
        Utc::now().date_naive(),
    )?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.subscription(id)?))
}

async fn farmer_subscriptions(
    State(state): State<AppState>,
    Path(id): Path<FarmerId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.subscriptions_for_farmer(id)?))
}

async fn upgrade_subscription(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
    Json(body): Json<UpgradeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.lifecycle.upgrade_subscription(
        id,
        body.new_subscription_type_id,
        Utc::now().date_naive(),
    )?;
    Ok(Json(outcome))
}

async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.lifecycle.cancel_subscription(id)?))
}

async fn attach_resource(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
    Json(body): Json<AttachBody>,
) -> Result<impl IntoResponse, ApiError> {
    let allocation = state.lifecycle.attach_resource(
        id,
        body.resource_id,
        body.quantity,
        Utc::now().date_naive(),
    )?;
    Ok((StatusCode::CREATED, Json(allocation)))
}

async fn detach_resource(
    State(state): State<AppState>,
    Path((id, resource_id)): Path<(SubscriptionId, ResourceId)>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.detach_resource(id, resource_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn available_resources(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.available_resources(id)?))
}

async fn utilization(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.lifecycle.utilization(id)?))
}

async fn list_payments(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<impl IntoResponse, ApiError> {
    // 404 for unknown ids rather than an empty list.
    state.store.subscription(id)?;
    Ok(Json(state.store.payments_for_subscription(id)?))
}
