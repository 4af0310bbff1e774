//! REST API routes.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use serde_json::json;
use skylane_core::{Coordinate, PlannedRoute, RouteOutcome, RouteRequest};
use std::sync::Arc;

use crate::api::request_id::{ensure_request_id, RequestId};
use crate::state::AppState;

/// Create the API router.
pub fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/v1/routes/plan", post(plan_route))
        .route("/v1/terrain/stats", get(terrain_stats))
        .layer(middleware::from_fn(ensure_request_id))
}

fn line_string(coordinates: &[Coordinate]) -> serde_json::Value {
    json!({ "type": "LineString", "coordinates": coordinates })
}

fn polygon(ring: &[Coordinate]) -> serde_json::Value {
    json!({ "type": "Polygon", "coordinates": [ring] })
}

fn found_body(planned: &PlannedRoute) -> serde_json::Value {
    json!({
        "ok": true,
        "route": line_string(&planned.route.coordinates),
        "length_m": planned.route.length_m,
        "stage": planned.stage,
        "corridor": planned.corridor.as_deref().map(polygon),
        "nodes_visited": planned.nodes_visited,
        "planned_at": Utc::now().to_rfc3339(),
    })
}

/// Failure bodies carry the request id so clients can quote it.
async fn plan_route(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<RouteRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "ok": false,
                    "error": rejection.body_text(),
                    "request_id": request_id.0,
                })),
            );
        }
    };

    match state.engine().plan(&request).await {
        Ok(RouteOutcome::Found(planned)) => (StatusCode::OK, Json(found_body(&planned))),
        Ok(RouteOutcome::NotFound { reason }) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "ok": false,
                "error": "route not found",
                "reason": reason,
                "request_id": request_id.0,
            })),
        ),
        Err(err) => {
            tracing::debug!("Rejected route request: {}", err);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "ok": false,
                    "error": err.to_string(),
                    "request_id": request_id.0,
                })),
            )
        }
    }
}

async fn terrain_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let elevation = state.engine().elevation();
    let stats = elevation.stats();
    Json(json!({
        "hits": stats.hits,
        "misses": stats.misses,
        "fetches": stats.fetches,
        "failures": stats.failures,
        "cached_tiles": elevation.cached_tiles(),
        "zoom": elevation.config().zoom,
    }))
}
