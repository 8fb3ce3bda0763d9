//! HTTP/JSON API over the pipeline.
//!
//! Every response is the `{ok, data?, error?}` envelope the browser UI
//! consumes. Read endpoints never block on a running refresh: they project
//! the last published snapshot.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::errors::StoreError;
use crate::models::PriceDiffItem;
use crate::scheduler::SchedulerState;
use crate::scrapers::{BuffClient, YoupinClient};
use crate::settings::{SettingsPatch, SettingsStore};
use crate::tokens::{
    BuffCredentialsUpdate, TokenStore, YoupinCredentialsUpdate, MARKET_BUFF, MARKET_YOUPIN,
};
use crate::updater::UpdateManager;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<UpdateManager>,
    pub settings: Arc<SettingsStore>,
    pub tokens: Arc<TokenStore>,
    pub buff: Arc<BuffClient>,
    pub youpin: Arc<YoupinClient>,
    pub scheduler: Arc<SchedulerState>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        ok: true,
        data: Some(data),
        error: None,
    })
}

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiResponse<Value>>) {
    (
        status,
        Json(ApiResponse {
            ok: false,
            data: None,
            error: Some(message.into()),
        }),
    )
}

fn store_err(e: StoreError) -> (StatusCode, Json<ApiResponse<Value>>) {
    let status = match &e {
        StoreError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
        StoreError::PersistFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    err(status, e.to_string())
}

/// Builds the full application router. The API is nested under
/// `base_path` (commonly `/api`); `/health` stays unprefixed.
pub fn router(state: AppState, base_path: &str) -> Router {
    let api = Router::new()
        .route("/items", get(get_items))
        .route("/status", get(get_status))
        .route("/statistics", get(get_statistics))
        .route("/update", post(post_update))
        .route("/incremental_update", post(post_incremental_update))
        .route("/cancel_update", post(post_cancel_update))
        .route("/settings", get(get_settings).post(post_settings))
        .route("/price_range", get(get_price_range).post(post_price_range))
        .route(
            "/buff_price_range",
            get(get_buff_price_range).post(post_buff_price_range),
        )
        .route("/tokens/status", get(get_tokens_status))
        .route("/tokens/test/:marketplace", post(post_tokens_test))
        .route("/tokens/:marketplace", post(post_tokens_update));

    let root = Router::new().route("/health", get(health));
    let root = if base_path.is_empty() {
        root.merge(api)
    } else {
        root.nest(base_path, api)
    };

    root.layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            crate::middleware::logging::request_logging,
        ))
        .with_state(state)
}

async fn health() -> Json<ApiResponse<Value>> {
    ok(json!({ "status": "alive" }))
}

#[derive(Debug, Deserialize)]
struct ItemsQuery {
    min_diff: Option<f64>,
    sort_by: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ItemsData {
    items: Vec<PriceDiffItem>,
    total_count: usize,
    last_updated: Option<DateTime<Utc>>,
}

async fn get_items(
    State(state): State<AppState>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<ApiResponse<ItemsData>>, (StatusCode, Json<ApiResponse<Value>>)> {
    let current = state.manager.current();

    let mut items: Vec<PriceDiffItem> = current
        .items
        .iter()
        .filter(|p| query.min_diff.map_or(true, |min| p.price_diff >= min))
        .cloned()
        .collect();

    match query.sort_by.as_deref() {
        None | Some("margin") => {} // published order is already margin-first
        Some("diff") => {
            items.sort_by(|a, b| {
                b.price_diff
                    .total_cmp(&a.price_diff)
                    .then_with(|| b.profit_margin.total_cmp(&a.profit_margin))
                    .then_with(|| a.key.cmp(&b.key))
            });
        }
        Some(other) => {
            return Err(err(
                StatusCode::BAD_REQUEST,
                format!("unknown sort_by '{other}', expected 'diff' or 'margin'"),
            ));
        }
    }

    if let Some(limit) = query.limit {
        items.truncate(limit);
    }

    let total_count = items.len();
    Ok(ok(ItemsData {
        items,
        total_count,
        last_updated: current.built_at,
    }))
}

async fn get_status(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    ok(json!({
        "updater": state.manager.status(),
        "scheduler": state.scheduler.snapshot(),
    }))
}

async fn get_statistics(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let current = state.manager.current();
    let count = current.items.len();

    let stats = |values: &mut dyn Iterator<Item = f64>| -> Value {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 {
            json!({ "mean": null, "min": null, "max": null })
        } else {
            json!({ "mean": sum / count as f64, "min": min, "max": max })
        }
    };

    let diff_stats = stats(&mut current.items.iter().map(|p| p.price_diff));
    let margin_stats = stats(&mut current.items.iter().map(|p| p.profit_margin));

    ok(json!({
        "count": count,
        "price_diff": diff_stats,
        "profit_margin": margin_stats,
        "last_built_at": current.built_at,
    }))
}

async fn post_update(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    if state.manager.is_running() {
        return ok(json!({ "started": false, "reason": "refresh already running" }));
    }

    let manager = state.manager.clone();
    tokio::spawn(async move {
        let _ = manager.run_full_refresh().await;
    });
    info!("🔄 Full refresh requested via API");
    ok(json!({ "started": true, "mode": "full" }))
}

async fn post_incremental_update(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    if state.manager.is_running() {
        return ok(json!({ "started": false, "reason": "refresh already running" }));
    }

    let manager = state.manager.clone();
    tokio::spawn(async move {
        let _ = manager.run_incremental_refresh().await;
    });
    info!("🔄 Incremental refresh requested via API");
    ok(json!({ "started": true, "mode": "incremental" }))
}

/// Cooperative cancellation of the in-flight refresh. The published set
/// stays whatever the last completed cycle produced.
async fn post_cancel_update(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    if !state.manager.is_running() {
        return ok(json!({ "cancelled": false, "reason": "no refresh running" }));
    }
    state.manager.cancel();
    info!("🛑 Refresh cancellation requested via API");
    ok(json!({ "cancelled": true }))
}

async fn get_settings(State(state): State<AppState>) -> Json<ApiResponse<crate::settings::Settings>> {
    ok(state.settings.snapshot())
}

async fn post_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<ApiResponse<crate::settings::Settings>>, (StatusCode, Json<ApiResponse<Value>>)> {
    state.settings.apply(patch).map(ok).map_err(store_err)
}

#[derive(Debug, Deserialize)]
struct RangeBody {
    min: f64,
    max: f64,
}

async fn get_price_range(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let s = state.settings.snapshot();
    ok(json!({ "min": s.price_diff_min, "max": s.price_diff_max }))
}

async fn post_price_range(
    State(state): State<AppState>,
    Json(body): Json<RangeBody>,
) -> Result<Json<ApiResponse<Value>>, (StatusCode, Json<ApiResponse<Value>>)> {
    let updated = state
        .settings
        .set_price_diff_range(body.min, body.max)
        .map_err(store_err)?;
    Ok(ok(json!({
        "min": updated.price_diff_min,
        "max": updated.price_diff_max,
    })))
}

#[derive(Debug, Deserialize)]
struct BuffRangeBody {
    min: f64,
    max: Option<f64>,
}

async fn get_buff_price_range(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let s = state.settings.snapshot();
    ok(json!({ "min": s.buff_price_min, "max": s.buff_price_max }))
}

async fn post_buff_price_range(
    State(state): State<AppState>,
    Json(body): Json<BuffRangeBody>,
) -> Result<Json<ApiResponse<Value>>, (StatusCode, Json<ApiResponse<Value>>)> {
    let updated = state
        .settings
        .set_buff_price_range(body.min, body.max)
        .map_err(store_err)?;
    Ok(ok(json!({
        "min": updated.buff_price_min,
        "max": updated.buff_price_max,
    })))
}

async fn get_tokens_status(State(state): State<AppState>) -> Json<ApiResponse<crate::tokens::TokensStatus>> {
    ok(state.tokens.status())
}

async fn post_tokens_update(
    State(state): State<AppState>,
    Path(marketplace): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<Value>>, (StatusCode, Json<ApiResponse<Value>>)> {
    match marketplace.as_str() {
        MARKET_BUFF => {
            let update: BuffCredentialsUpdate = serde_json::from_value(body)
                .map_err(|e| err(StatusCode::BAD_REQUEST, format!("invalid body: {e}")))?;
            state.tokens.update_buff(update).map_err(store_err)?;
        }
        MARKET_YOUPIN => {
            let update: YoupinCredentialsUpdate = serde_json::from_value(body)
                .map_err(|e| err(StatusCode::BAD_REQUEST, format!("invalid body: {e}")))?;
            state.tokens.update_youpin(update).map_err(store_err)?;
        }
        other => {
            return Err(err(
                StatusCode::NOT_FOUND,
                format!("unknown marketplace '{other}'"),
            ));
        }
    }

    Ok(ok(json!({ "marketplace": marketplace, "updated": true })))
}

async fn post_tokens_test(
    State(state): State<AppState>,
    Path(marketplace): Path<String>,
) -> Result<Json<ApiResponse<Value>>, (StatusCode, Json<ApiResponse<Value>>)> {
    let probe = match marketplace.as_str() {
        MARKET_BUFF => state.buff.probe().await,
        MARKET_YOUPIN => state.youpin.probe().await,
        other => {
            return Err(err(
                StatusCode::NOT_FOUND,
                format!("unknown marketplace '{other}'"),
            ));
        }
    };

    match probe {
        Ok(items_observed) => Ok(ok(json!({
            "marketplace": marketplace,
            "items_observed": items_observed,
        }))),
        Err(e) => Err(err(
            StatusCode::BAD_GATEWAY,
            format!("{marketplace} probe failed: {e}"),
        )),
    }
}
