//! Recommendation admission and lifecycle control plane.
//!
//! Exposes the engine modules for use by the binary and by integration
//! tests. The HTTP surface lives in `api`, which depends on the `AppState`
//! assembled in `main.rs`.

pub mod admission;
pub mod api;
pub mod chain;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod exposure;
pub mod gates;
pub mod lifecycle;
pub mod price_feed;
pub mod query;
pub mod store;
