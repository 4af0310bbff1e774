use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{json, Value};
use skylane_core::RouteEngineConfig;
use std::sync::Arc;
use tower::ServiceExt;

use crate::route_planner::RouteEngine;
use crate::terrain::tests::{fast_config, FakeTiles};
use crate::terrain::ElevationService;
use crate::{api, config::Config, state::AppState};

fn setup_app(source: FakeTiles) -> axum::Router {
    let elevation = ElevationService::new(Arc::new(source), fast_config());
    let engine = RouteEngine::new(elevation, RouteEngineConfig::default());
    let state = Arc::new(AppState::with_engine(Config::default(), engine));
    api::routes().with_state(state)
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("parse json")
}

fn plan_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/routes/plan")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_echoes_request_id() {
    let app = setup_app(FakeTiles::flat(0.0));
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-42")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-42");
}

#[tokio::test]
async fn plans_route_around_circle() {
    let app = setup_app(FakeTiles::flat(100.0));
    let circle: Vec<[f64; 2]> = (0..16)
        .map(|i| {
            let angle = i as f64 / 16.0 * std::f64::consts::TAU;
            // About 0.5 m around [1, 0].
            [1.0 + 4.5e-6 * angle.cos(), 4.5e-6 * angle.sin()]
        })
        .collect();
    let body = json!({
        "start": [0.0, 0.0],
        "end": [2.0, 0.0],
        "noFlyZones": [{ "type": "Polygon", "coordinates": [circle] }],
        "corridorWidth": 0.0
    });

    let response = app.oneshot(plan_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = read_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["route"]["type"], "LineString");
    let coordinates = body["route"]["coordinates"].as_array().unwrap();
    assert!(coordinates.len() >= 3);
    assert_eq!(coordinates[0], json!([0.0, 0.0]));
    assert_eq!(coordinates[coordinates.len() - 1], json!([2.0, 0.0]));
    assert_eq!(body["stage"], "visibility_graph");
    assert!(body["length_m"].as_f64().unwrap() > 222_000.0);
    assert!(body["corridor"].is_null());
}

#[tokio::test]
async fn direct_route_carries_corridor_polygon() {
    let app = setup_app(FakeTiles::flat(100.0));
    let body = json!({
        "start": [8.50, 47.30],
        "end": [8.52, 47.31],
        "no_fly_zones": [],
        "corridor_width": 40.0
    });
    let response = app.oneshot(plan_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["stage"], "direct");
    assert_eq!(body["corridor"]["type"], "Polygon");
    let ring = body["corridor"]["coordinates"][0].as_array().unwrap();
    assert!(ring.len() >= 4);
    assert_eq!(ring.first(), ring.last());
}

#[tokio::test]
async fn enclosed_route_is_not_found() {
    let app = setup_app(FakeTiles::flat(0.0));
    let body = json!({
        "start": [0.0, 0.0],
        "end": [0.01, 0.0],
        "noFlyZones": [[[[-0.001, -0.001], [0.011, -0.001], [0.011, 0.001], [-0.001, 0.001]]]],
        "corridorWidth": 10.0
    });
    let response = app.oneshot(plan_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let header = response.headers()["x-request-id"].to_str().unwrap().to_string();
    let body = read_json(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["reason"], "no_path_found");
    assert_eq!(body["request_id"], header.as_str());
}

#[tokio::test]
async fn unreachable_terrain_reports_reason() {
    let app = setup_app(FakeTiles {
        fail_first: usize::MAX,
        ..FakeTiles::flat(0.0)
    });
    let body = json!({
        "start": [0.0, 0.0],
        "end": [0.01, 0.0],
        "corridorWidth": 10.0
    });
    let response = app.oneshot(plan_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = read_json(response).await;
    assert_eq!(body["reason"], "elevation_unavailable");
}

#[tokio::test]
async fn invalid_input_is_bad_request() {
    let app = setup_app(FakeTiles::flat(0.0));

    let same_point = json!({ "start": [1.0, 1.0], "end": [1.0, 1.0], "corridorWidth": 5.0 });
    let mut request = plan_request(same_point);
    request
        .headers_mut()
        .insert("x-request-id", "bad-input-1".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["request_id"], "bad-input-1");

    let negative_width = json!({ "start": [0.0, 0.0], "end": [1.0, 1.0], "corridorWidth": -1.0 });
    let response = app.clone().oneshot(plan_request(negative_width)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let missing_end = json!({ "start": [0.0, 0.0] });
    let response = app.oneshot(plan_request(missing_end)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn terrain_stats_track_fetches() {
    let app = setup_app(FakeTiles::flat(0.0));
    let body = json!({ "start": [0.0, 0.0], "end": [0.001, 0.0], "corridorWidth": 0.0 });
    let response = app.clone().oneshot(plan_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .uri("/v1/terrain/stats")
        .body(Body::empty())
        .unwrap();
    let stats = read_json(app.oneshot(request).await.unwrap()).await;
    assert_eq!(stats["fetches"], 1);
    assert_eq!(stats["cached_tiles"], 1);
    assert_eq!(stats["zoom"], 12);
}
