//! Commerce API Library
//!
//! Shopping cart, order lifecycle, stock ledger and payment gateway behind an axum HTTP API.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod migrator;
pub mod services;

use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    http::HeaderValue,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    auth::AuthService, cache::CacheBackend, config::AppConfig, db::DbPool,
    services::factory::ServiceContainer,
};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: Arc<AppConfig>,
    pub cache: Arc<dyn CacheBackend>,
    pub services: ServiceContainer,
    pub auth: Arc<AuthService>,
}

impl FromRef<AppState> for Arc<AuthService> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

/// Routes of the versioned API, to be nested under `/api/v1`
pub fn api_v1_routes() -> Router<AppState> {
    let orders = Router::new()
        .route("/order", get(handlers::orders::list_orders))
        .route("/order/update", post(handlers::orders::update_cart))
        .route("/order/cart", get(handlers::orders::get_cart))
        .route("/order/:id", get(handlers::orders::get_order))
        .route("/order/:id/pay", post(handlers::orders::pay_cart))
        .route("/order/:id/cancel", post(handlers::orders::cancel_order))
        .route("/order/:id/delivery", post(handlers::orders::deliver_order));

    let stock = Router::new()
        .route("/stock/product/:id", get(handlers::stock::get_stock))
        .route("/stock/product/:id/add", post(handlers::stock::add_stock))
        .route("/stock/product/:id/remove", post(handlers::stock::remove_stock));

    Router::new().merge(orders).merge(stock)
}

/// Full application router with the HTTP middleware stack applied
pub fn app(state: AppState) -> Router {
    let cors_layer = cors_layer(&state.config);
    let timeout = state.config.request_timeout();

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_v1_routes())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .layer(cors_layer)
        .with_state(state)
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if config.is_development() {
        info!("Using permissive CORS because no origins were configured in development");
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    }
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let db_status = match db::check_connection(&state.db).await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    let cache_status = match state.cache.exists("health").await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    Json(json!({
        "status": if db_status == "healthy" && cache_status == "healthy" { "healthy" } else { "unhealthy" },
        "checks": {
            "database": db_status,
            "cache": cache_status,
        },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
