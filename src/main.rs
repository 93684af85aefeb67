//! Recommendation admission and lifecycle control plane.

mod admission;
mod api;
mod chain;
mod clock;
mod config;
mod domain;
mod error;
mod events;
mod exposure;
mod gates;
mod lifecycle;
mod price_feed;
mod query;
mod store;

use crate::admission::AdmissionController;
use crate::api::AppState;
use crate::clock::{system_clock, SharedClock};
use crate::config::{ConfigHandle, RuntimeConfig};
use crate::events::EventBus;
use crate::exposure::ExposureIndex;
use crate::lifecycle::LifecycleTracker;
use crate::price_feed::{PriceFeed, TestSignalOverrides};
use crate::store::Store;
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn load_env() {
    let _ = dotenv::dotenv();
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    for candidate in [manifest_dir.join(".env"), manifest_dir.join("../.env")] {
        if candidate.exists() {
            let _ = dotenv::from_path(&candidate);
        }
    }
}

/// Relative `RECO_DB_PATH` values resolve against the crate root, not the
/// caller's cwd, so `cargo run` from any directory finds the same file.
fn resolve_db_path() -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    match env::var("RECO_DB_PATH").ok().filter(|v| !v.trim().is_empty()) {
        Some(raw) => {
            let p = PathBuf::from(&raw);
            if p.is_absolute() {
                raw
            } else {
                base.join(p).to_string_lossy().to_string()
            }
        }
        None => base.join("data/recommendations.db").to_string_lossy().to_string(),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reco_control_plane=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("recommendation control plane starting");

    let clock: SharedClock = system_clock();
    let db_path = resolve_db_path();
    if let Some(parent) = Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Store::open(&db_path).context("open recommendation store")?;
    info!(db_path = %db_path, "recommendation store ready");

    let price_feed = Arc::new(PriceFeed::new(clock.clone()));
    let exposure = Arc::new(ExposureIndex::new(clock.clone()));
    let active_rows = store
        .list_active(Default::default())
        .await
        .context("load active recommendations at startup")?;
    exposure.rebuild(&active_rows);
    info!(active = active_rows.len(), "exposure index rebuilt from store");

    let runtime_config = RuntimeConfig::from_env();
    if runtime_config.testing.allow_price_override {
        price_feed.set_allow_override(true);
    }
    let fgi_overrides = Arc::new(TestSignalOverrides::new(clock.clone()));
    fgi_overrides.set_allow(runtime_config.testing.allow_fgi_override);
    let funding_rate_overrides = Arc::new(TestSignalOverrides::new(clock.clone()));
    funding_rate_overrides.set_allow(runtime_config.testing.allow_funding_rate_override);
    let config = ConfigHandle::new(runtime_config);

    let events = EventBus::new(256);

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
    tracker.start();
    info!("lifecycle tracker started");

    let state = AppState {
        store,
        price_feed,
        exposure,
        config,
        events,
        admission,
        tracker,
        fgi_overrides,
        funding_rate_overrides,
    };

    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = env::var("RECO_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr).await.context("bind listener")?;
    info!(addr = %addr, "api server listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
