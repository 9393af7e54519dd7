//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::error::ApiError;
use super::state::AppState;
use crate::detect::metric::MetricRow;
use crate::detect::rule::NewRule;
use crate::detect::FindingAction;
use crate::storage::findings::FindingFilter;
use crate::storage::SqliteStore;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/detect", post(run_detection))
        .route("/findings", get(list_findings))
        .route("/findings/counts", get(finding_counts))
        .route("/findings/{id}", get(get_finding).patch(transition_finding))
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/{id}", patch(toggle_rule))
        .route("/metrics", post(ingest_metrics))
}

/// Run `f` against the store on the blocking pool.
async fn blocking<T, F>(store: &SqliteStore, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&SqliteStore) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store)).await?
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Deserialize)]
struct DetectParams {
    as_of: Option<NaiveDate>,
    lookback_days: Option<u32>,
}

async fn run_detection(
    State(state): State<AppState>,
    Query(params): Query<DetectParams>,
) -> Result<Json<Value>, ApiError> {
    let as_of = params.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let findings = state
        .runner
        .run(as_of, params.lookback_days)
        .await
        .map_err(ApiError::RunFailed)?;

    Ok(Json(json!({
        "data": findings,
        "meta": { "as_of": as_of, "total": findings.len() }
    })))
}

async fn list_findings(
    State(state): State<AppState>,
    Query(filter): Query<FindingFilter>,
) -> Result<Json<Value>, ApiError> {
    let limit = filter.limit();
    let offset = filter.offset.unwrap_or(0);
    let findings = blocking(&state.store, move |store| Ok(store.list_findings(&filter)?)).await?;

    Ok(Json(json!({
        "data": findings,
        "meta": { "total": findings.len(), "limit": limit, "offset": offset }
    })))
}

async fn finding_counts(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let counts = blocking(&state.store, |store| Ok(store.finding_counts()?)).await?;
    Ok(Json(json!({ "data": counts, "meta": {} })))
}

async fn get_finding(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let finding = blocking(&state.store, move |store| Ok(store.get_finding(id)?)).await?;
    Ok(Json(json!({ "data": finding, "meta": {} })))
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    action: FindingAction,
    #[serde(default)]
    actor: Option<String>,
}

async fn transition_finding(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<Value>, ApiError> {
    let finding = blocking(&state.store, move |store| {
        Ok(store.transition_finding(id, req.action, req.actor.as_deref())?)
    })
    .await?;
    Ok(Json(json!({ "data": finding, "meta": {} })))
}

async fn list_rules(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rules = blocking(&state.store, |store| Ok(store.list_rules()?)).await?;
    Ok(Json(json!({ "data": rules, "meta": { "total": rules.len() } })))
}

async fn create_rule(
    State(state): State<AppState>,
    Json(rule): Json<NewRule>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let rule = blocking(&state.store, move |store| Ok(store.insert_rule(rule)?)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": rule, "meta": {} }))))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<Value>, ApiError> {
    let rule = blocking(&state.store, move |store| Ok(store.set_rule_enabled(id, req.enabled)?)).await?;
    Ok(Json(json!({ "data": rule, "meta": {} })))
}

async fn ingest_metrics(
    State(state): State<AppState>,
    Json(rows): Json<Vec<MetricRow>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let inserted = blocking(&state.store, move |store| Ok(store.insert_metrics(&rows)?)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": { "inserted": inserted }, "meta": {} }))))
}
