//! SugarBox
//!
//! Offline-first save-game manager. The device side keeps games, characters and
//! saves in a local SQLite store and reconciles them with a sync server; the
//! server side is the axum application built by [`create_router`].

pub mod api;
pub mod archive;
pub mod auth;
pub mod channel;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod session;
pub mod store;
pub mod sync;
pub mod validation;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use db::Repository;

/// Upload bodies carry save blobs, so sync-up accepts far more than the default limit.
const SYNC_UP_BODY_LIMIT: usize = 50 * 1024 * 1024;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub config: Arc<Config>,
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Routes that require a valid access token
    let protected_routes = Router::new()
        .route("/auth/logout", post(api::logout))
        .route("/auth/self", get(api::current_user))
        .route(
            "/sync/up",
            post(api::sync_up).layer(DefaultBodyLimit::max(SYNC_UP_BODY_LIMIT)),
        )
        .route("/sync/down", get(api::sync_down))
        .route("/user/sessions", get(api::list_sessions))
        .route("/user/session/{id}", delete(api::revoke_session))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::bearer_auth_layer,
        ));

    let api_routes = Router::new()
        .route("/auth/register", post(api::register))
        .route("/auth/login", post(api::login))
        .route("/auth/refresh", get(api::refresh))
        .merge(protected_routes);

    // Health check (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests;
