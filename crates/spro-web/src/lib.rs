//! Axum JSON API for SPRO. Routes are thin: identity comes from the proxy
//! headers, everything else is delegated to the workflow engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use spro_catalog::{
    maybe_build_scheduler, CatalogConfig, CatalogService, CatalogSource, HttpCatalogSource,
    StaticCatalogSource,
};
use spro_core::{
    Agreement, DomainGroup, Offer, OfferStatus, Order, Principal, ResubmissionUpdate, Role,
    ServiceRequest, ServiceRequestDraft, ThreadRngRandomness, WorkflowError,
};
use spro_engine::{OfferGeneration, RequestSummary, WorkflowEngine};
use spro_store::DocumentStore;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "spro-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub catalog: Arc<CatalogService>,
}

impl AppState {
    pub fn new(engine: Arc<WorkflowEngine>, catalog: Arc<CatalogService>) -> Self {
        Self { engine, catalog }
    }

    /// Wire up a full state from a catalog source. Used by `serve_from_env`
    /// and by tests.
    pub fn from_source(source: Arc<dyn CatalogSource>) -> Self {
        let store = Arc::new(DocumentStore::new());
        let catalog = Arc::new(CatalogService::new(source, store.clone()));
        let engine = Arc::new(WorkflowEngine::new(
            store,
            catalog.clone(),
            Arc::new(ThreadRngRandomness),
        ));
        Self { engine, catalog }
    }
}

/// [`WorkflowError`] carried across the handler boundary. The taxonomy maps
/// one-to-one onto HTTP statuses here and nowhere else.
pub struct ApiError(WorkflowError);

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self.0 {
            WorkflowError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            WorkflowError::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            WorkflowError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            WorkflowError::Upstream(m) => (StatusCode::BAD_GATEWAY, m),
        };
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Principal extracted from the `x-user-id` / `x-user-role` headers the
/// identity proxy injects. Guarded routes reject with 403 when the headers
/// are absent or carry an unknown role.
pub struct Identity(pub Principal);

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ApiError(WorkflowError::Forbidden("missing x-user-id header".into()))
            })?;
        let role_label = parts
            .headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError(WorkflowError::Forbidden("missing x-user-role header".into()))
            })?;
        let role = Role::parse(role_label).map_err(|_| {
            ApiError(WorkflowError::Forbidden(format!(
                "unknown principal role `{role_label}`"
            )))
        })?;
        Ok(Identity(Principal {
            id: id.to_string(),
            role,
        }))
    }
}

// --- request/response bodies ---

#[derive(Debug, Deserialize)]
struct CommentBody {
    comment: String,
}

#[derive(Debug, Deserialize)]
struct StatusUpdateBody {
    status: String,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CycleUpdateBody {
    cycle_status: String,
}

#[derive(Debug, Deserialize)]
struct EvaluateOfferBody {
    status: OfferStatus,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResubmitOfferBody {
    price: f64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        // service requests
        .route("/service-requests", post(create_request).get(all_requests))
        .route("/service-requests/directsubmit", post(direct_submit))
        .route("/service-requests/drafts", get(drafts))
        .route("/service-requests/assigned", get(assigned))
        .route("/service-requests/approved", get(approved))
        .route("/service-requests/published", get(published))
        .route("/service-requests/status/{status}", get(user_requests_by_status))
        .route("/service-requests/{id}", get(request_details).put(edit_draft))
        .route("/service-requests/{id}/submit", post(submit))
        .route("/service-requests/{id}/assign", post(assign))
        .route("/service-requests/{id}/approve", post(approve))
        .route("/service-requests/{id}/reject", post(reject))
        .route(
            "/service-requests/{id}/send-for-pm-evaluation",
            post(send_for_pm_evaluation),
        )
        .route("/service-requests/{id}/cycle-status", patch(update_cycle_status))
        .route("/service-requests/{id}/status", patch(update_status))
        // offers
        .route("/offers/generate/{request_id}", post(generate_offers))
        .route("/offers/request/{request_id}", get(offers_for_request))
        .route("/offers/request/{request_id}/selected", get(selected_offers))
        .route("/offers/{id}/select", patch(select_offer))
        .route("/offers/{id}/deselect", patch(deselect_offer))
        .route("/offers/{id}/evaluate", patch(evaluate_offer))
        .route("/offers/{id}/revise", patch(revise_offer))
        .route("/offers/{id}/resubmit", patch(resubmit_offer))
        // orders
        .route("/orders", get(all_orders))
        .route("/orders/user", get(user_orders))
        .route("/orders/user/{order_id}", get(user_order))
        .route("/orders/pm/{provider_id}", get(pm_orders))
        .route("/orders/pm/{provider_id}/{order_id}", get(pm_order))
        .route("/orders/{request_id}", post(create_order).get(order_by_id))
        // catalog
        .route("/catalog/agreements", get(catalog_agreements))
        .route("/catalog/agreements/{id}", get(catalog_details))
        .route("/catalog/refresh", post(catalog_refresh))
        .with_state(state)
}

/// Bind and serve. The catalog source is the remote gateway when
/// `SPRO_CATALOG_URL` is set, otherwise the in-process seed.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = CatalogConfig::from_env();
    let source: Arc<dyn CatalogSource> = if std::env::var("SPRO_CATALOG_URL").is_ok() {
        Arc::new(HttpCatalogSource::new(&config)?)
    } else {
        Arc::new(StaticCatalogSource::seeded())
    };
    let state = AppState::from_source(source);

    if let Some(scheduler) = maybe_build_scheduler(&config, state.catalog.clone()).await? {
        scheduler.start().await?;
        info!(cron = %config.refresh_cron, "catalog refresh scheduler started");
    }

    let port: u16 = std::env::var("SPRO_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// --- service request handlers ---

async fn create_request(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Json(draft): Json<ServiceRequestDraft>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(state.engine.create_request(&principal, draft).await?))
}

async fn direct_submit(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Json(draft): Json<ServiceRequestDraft>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(state.engine.direct_submit(&principal, draft).await?))
}

async fn edit_draft(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Path(id): Path<Uuid>,
    Json(draft): Json<ServiceRequestDraft>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(state.engine.edit_draft(&principal, id, draft).await?))
}

async fn submit(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Path(id): Path<Uuid>,
    Json(update): Json<ResubmissionUpdate>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(state.engine.submit(&principal, id, update).await?))
}

async fn assign(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Path(id): Path<Uuid>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(state.engine.assign_to_self(&principal, id).await?))
}

async fn approve(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Path(id): Path<Uuid>,
    Json(body): Json<CommentBody>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(state.engine.approve(&principal, id, &body.comment).await?))
}

async fn reject(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Path(id): Path<Uuid>,
    Json(body): Json<CommentBody>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(state.engine.reject(&principal, id, &body.comment).await?))
}

async fn send_for_pm_evaluation(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Path(id): Path<Uuid>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(state.engine.send_for_pm_evaluation(&principal, id).await?))
}

async fn update_cycle_status(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Path(id): Path<Uuid>,
    Json(body): Json<CycleUpdateBody>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(
        state
            .engine
            .update_cycle_status(&principal, id, &body.cycle_status)
            .await?,
    ))
}

async fn update_status(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusUpdateBody>,
) -> ApiResult<ServiceRequest> {
    Ok(Json(
        state
            .engine
            .update_status(&principal, id, &body.status, body.comment)
            .await?,
    ))
}

async fn request_details(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<RequestSummary> {
    Ok(Json(state.engine.request_details(id).await?))
}

async fn drafts(
    State(state): State<AppState>,
    Identity(principal): Identity,
) -> ApiResult<Vec<RequestSummary>> {
    Ok(Json(state.engine.drafts(&principal.id).await))
}

async fn assigned(
    State(state): State<AppState>,
    Identity(principal): Identity,
) -> ApiResult<Vec<RequestSummary>> {
    Ok(Json(state.engine.assigned_to(&principal.id).await))
}

async fn approved(
    State(state): State<AppState>,
    Identity(principal): Identity,
) -> ApiResult<Vec<RequestSummary>> {
    Ok(Json(state.engine.approved_by(&principal.id).await))
}

async fn published(State(state): State<AppState>) -> ApiResult<Vec<RequestSummary>> {
    Ok(Json(state.engine.published().await))
}

async fn all_requests(
    State(state): State<AppState>,
) -> ApiResult<BTreeMap<String, Vec<RequestSummary>>> {
    Ok(Json(state.engine.all_grouped_by_status().await))
}

async fn user_requests_by_status(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Path(status): Path<String>,
) -> ApiResult<Vec<RequestSummary>> {
    Ok(Json(state.engine.user_requests(&principal.id, &status).await?))
}

// --- offer handlers ---

async fn generate_offers(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<OfferGeneration> {
    Ok(Json(state.engine.generate_offers(request_id).await?))
}

async fn offers_for_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Vec<Offer>> {
    Ok(Json(state.engine.offers_for_request(request_id).await?))
}

async fn selected_offers(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Vec<Offer>> {
    Ok(Json(state.engine.selected_offers(request_id).await))
}

async fn select_offer(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Offer> {
    Ok(Json(state.engine.select_offer(id).await?))
}

async fn deselect_offer(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Offer> {
    Ok(Json(state.engine.deselect_offer(id).await?))
}

async fn evaluate_offer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<EvaluateOfferBody>,
) -> ApiResult<Offer> {
    Ok(Json(
        state.engine.evaluate_offer(id, body.status, body.comment).await?,
    ))
}

async fn revise_offer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CommentBody>,
) -> ApiResult<Offer> {
    Ok(Json(state.engine.revise_offer(id, body.comment).await?))
}

async fn resubmit_offer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResubmitOfferBody>,
) -> ApiResult<Offer> {
    Ok(Json(state.engine.resubmit_offer(id, body.price).await?))
}

// --- order handlers ---

async fn create_order(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Order> {
    Ok(Json(state.engine.create_order(request_id).await?))
}

async fn all_orders(State(state): State<AppState>) -> ApiResult<Vec<Order>> {
    Ok(Json(state.engine.all_orders().await))
}

async fn order_by_id(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Order> {
    Ok(Json(state.engine.order(id).await?))
}

async fn user_orders(
    State(state): State<AppState>,
    Identity(principal): Identity,
) -> ApiResult<Vec<Order>> {
    Ok(Json(state.engine.user_orders(&principal.id).await?))
}

async fn user_order(
    State(state): State<AppState>,
    Identity(principal): Identity,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Order> {
    Ok(Json(state.engine.user_order(&principal.id, order_id).await?))
}

async fn pm_orders(
    State(state): State<AppState>,
    Path(provider_id): Path<i64>,
) -> ApiResult<Vec<Order>> {
    Ok(Json(state.engine.pm_orders(provider_id).await?))
}

async fn pm_order(
    State(state): State<AppState>,
    Path((provider_id, order_id)): Path<(i64, Uuid)>,
) -> ApiResult<Order> {
    Ok(Json(state.engine.pm_order(provider_id, order_id).await?))
}

// --- catalog handlers ---

async fn catalog_agreements(State(state): State<AppState>) -> ApiResult<Vec<Agreement>> {
    Ok(Json(state.catalog.agreements().await?))
}

async fn catalog_details(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<DomainGroup>> {
    Ok(Json(state.catalog.details(id).await?))
}

async fn catalog_refresh(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let refreshed = state.catalog.refresh_all().await?;
    Ok(Json(serde_json::json!({ "refreshed": refreshed })))
}
