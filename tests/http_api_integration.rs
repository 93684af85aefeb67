//! End-to-end coverage of the admission/lifecycle engine through the axum
//! router, exercising the literal scenarios from the admission and
//! lifecycle contract: same-direction cooldown, duplicate detection, the
//! total exposure cap, and the `active` listing's `count` invariant.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use reco_control_plane::admission::AdmissionController;
use reco_control_plane::api::{self, AppState};
use reco_control_plane::clock::{SharedClock, TestClock};
use reco_control_plane::config::{ConfigHandle, RuntimeConfig};
use reco_control_plane::events::EventBus;
use reco_control_plane::exposure::ExposureIndex;
use reco_control_plane::lifecycle::LifecycleTracker;
use reco_control_plane::price_feed::{PriceFeed, TestSignalOverrides};
use reco_control_plane::store::Store;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct Harness {
    app: axum::Router,
    clock: Arc<TestClock>,
    price_feed: Arc<PriceFeed>,
}

fn build_harness(config: RuntimeConfig) -> Harness {
    let test_clock = Arc::new(TestClock::new(chrono::Utc::now()));
    let clock: SharedClock = test_clock.clone();
    let store = Store::open_in_memory().unwrap();
    let price_feed = Arc::new(PriceFeed::new(clock.clone()));
    price_feed.set_allow_override(true);
    let exposure = Arc::new(ExposureIndex::new(clock.clone()));
    let config = ConfigHandle::new(config);
    let events = EventBus::new(64);

    let admission = Arc::new(AdmissionController::new(
        store.clone(),
        price_feed.clone(),
        exposure.clone(),
        config.clone(),
        events.clone(),
        clock.clone(),
    ));
    let tracker = Arc::new(LifecycleTracker::new(
        store.clone(),
        price_feed.clone(),
        exposure.clone(),
        config.clone(),
        events.clone(),
        clock.clone(),
    ));

    let state = AppState {
        store,
        price_feed: price_feed.clone(),
        exposure,
        config,
        events,
        admission,
        tracker,
        fgi_overrides: Arc::new(TestSignalOverrides::new(clock.clone())),
        funding_rate_overrides: Arc::new(TestSignalOverrides::new(clock.clone())),
    };

    Harness {
        app: api::router(state),
        clock: test_clock,
        price_feed,
    }
}

async fn post_json(app: &axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn get_json(app: &axum::Router, path: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn create_body(symbol: &str, entry_price: f64) -> Value {
    json!({
        "symbol": symbol,
        "direction": "LONG",
        "entryPrice": entry_price,
        "leverage": 2.0,
        "positionSize": 1.0,
        "atrValue": 10.0,
    })
}

#[tokio::test]
async fn same_direction_cooldown_then_admits_after_window() {
    let mut config = RuntimeConfig::default();
    config.cooldown_same_direction_ms = 2_000;
    config.cooldown_opposite_ms = 0;
    config.testing.allow_price_override = true;
    let harness = build_harness(config);
    harness.price_feed.push("S1", 1000.0);

    let (status, body) = post_json(&harness.app, "/recommendations", create_body("S1", 1000.0)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);

    let (status, body) = post_json(&harness.app, "/recommendations", create_body("S1", 1020.0)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "COOLDOWN_ACTIVE");
    let remaining = body["error"]["details"]["remainingMs"].as_i64().unwrap();
    assert!(remaining > 0 && remaining <= 2_000);

    harness.clock.advance(chrono::Duration::milliseconds(2_100));
    let (status, _) = post_json(&harness.app, "/recommendations", create_body("S1", 1030.0)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn duplicate_within_bps_threshold_is_rejected() {
    let mut config = RuntimeConfig::default();
    config.cooldown_same_direction_ms = 0;
    let harness = build_harness(config);
    harness.price_feed.push("S2", 2000.0);

    let (status, first) = post_json(&harness.app, "/recommendations", create_body("S2", 2000.0)).await;
    assert_eq!(status, StatusCode::CREATED);
    let first_id = first["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = post_json(&harness.app, "/recommendations", create_body("S2", 2001.0)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "DUPLICATE_RECOMMENDATION");
    let matched = body["error"]["details"]["matchedIds"].as_array().unwrap();
    assert!(matched.iter().any(|v| v.as_str() == Some(first_id.as_str())));
}

#[tokio::test]
async fn exposure_total_cap_rejects_when_strictly_exceeded() {
    let mut config = RuntimeConfig::default();
    config.cooldown_same_direction_ms = 0;
    config.net_exposure_caps.total = 1.5;
    let harness = build_harness(config);
    harness.price_feed.push("ETH", 100.0);

    let mut body = create_body("ETH", 100.0);
    body["positionSize"] = json!(0.8);
    body["leverage"] = json!(1.0);
    let (status, _) = post_json(&harness.app, "/recommendations", body.clone()).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, rejected) = post_json(&harness.app, "/recommendations", body).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(rejected["error"]["code"], "EXPOSURE_CAP");
    let details = &rejected["error"]["details"];
    assert_eq!(details["totalCap"], 1.5);
    assert!((details["currentTotal"].as_f64().unwrap() - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn mtf_consistency_gate_blocks_then_admits_on_agreement() {
    let mut config = RuntimeConfig::default();
    config.cooldown_same_direction_ms = 0;
    config.entry_filters.require_mtf_agreement = true;
    config.entry_filters.min_mtf_agreement = 0.7;
    let harness = build_harness(config);
    harness.price_feed.push("BTC", 50_000.0);

    let mut rejected_body = create_body("BTC", 50_000.0);
    rejected_body["multiTFConsistency"] = json!({ "agreement": 0.5, "dominantDirection": "SHORT" });
    let (status, rejected) = post_json(&harness.app, "/recommendations", rejected_body).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(rejected["error"]["code"], "MTF_CONSISTENCY");
    assert_eq!(rejected["error"]["details"]["agreement"], 0.5);

    let mut approved_body = create_body("BTC", 50_000.0);
    approved_body["multiTFConsistency"] = json!({ "agreement": 0.85, "dominantDirection": "LONG" });
    let (status, _) = post_json(&harness.app, "/recommendations", approved_body).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn active_listing_count_matches_recommendations_length() {
    let mut config = RuntimeConfig::default();
    config.cooldown_same_direction_ms = 0;
    let harness = build_harness(config);
    harness.price_feed.push("A1", 10.0);
    harness.price_feed.push("A2", 20.0);

    post_json(&harness.app, "/recommendations", create_body("A1", 10.0)).await;
    post_json(&harness.app, "/recommendations", create_body("A2", 20.0)).await;

    let (status, body) = get_json(&harness.app, "/active-recommendations").await;
    assert_eq!(status, StatusCode::OK);
    let count = body["data"]["count"].as_u64().unwrap();
    let list_len = body["data"]["recommendations"].as_array().unwrap().len() as u64;
    assert_eq!(count, list_len);
    assert_eq!(count, 2);
}

#[tokio::test]
async fn bypass_cooldown_requires_strict_boolean_true() {
    let mut config = RuntimeConfig::default();
    config.cooldown_same_direction_ms = 60_000;
    let harness = build_harness(config);
    harness.price_feed.push("S3", 500.0);

    post_json(&harness.app, "/recommendations", create_body("S3", 500.0)).await;

    let mut body = create_body("S3", 550.0);
    body["bypassCooldown"] = json!("true");
    let (status, response) = post_json(&harness.app, "/recommendations", body).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS, "string \"true\" must not bypass cooldown");
    assert_eq!(response["error"]["code"], "COOLDOWN_ACTIVE");

    let mut body = create_body("S3", 560.0);
    body["bypassCooldown"] = json!(true);
    let (status, _) = post_json(&harness.app, "/recommendations", body).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn manual_close_is_idempotent() {
    let mut config = RuntimeConfig::default();
    config.cooldown_same_direction_ms = 0;
    let harness = build_harness(config);
    harness.price_feed.push("M1", 100.0);

    let (_, created) = post_json(&harness.app, "/recommendations", create_body("M1", 100.0)).await;
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let app = harness.app.clone();
    let close_once = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/recommendations/{id}/close"))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "exitPrice": 110.0 }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(close_once.status(), StatusCode::OK);

    let app = harness.app.clone();
    let close_twice = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/recommendations/{id}/close"))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "exitPrice": 120.0 }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(close_twice.status(), StatusCode::OK);
    let bytes = close_twice.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["data"]["exit_price"], 110.0, "second close returns the first close's persisted outcome");
}

#[tokio::test]
async fn health_endpoint_is_unauthenticated_and_plain() {
    let harness = build_harness(RuntimeConfig::default());
    let response = harness
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn fgi_override_is_rejected_unless_enabled_in_config() {
    let harness = build_harness(RuntimeConfig::default());
    let (status, body) = post_json(&harness.app, "/testing/fgi-override", json!({ "value": 25.0 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let mut config = RuntimeConfig::default();
    config.testing.allow_fgi_override = true;
    let harness = build_harness(config);
    let (status, body) = post_json(&harness.app, "/testing/fgi-override", json!({ "value": 25.0 })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}
