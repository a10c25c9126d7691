//! Read-only monitoring API.
//!
//! # Responsibilities
//! - Serve daemon, tier, backend and connection views as JSON
//! - Require a bearer token on every route
//!
//! # Design Decisions
//! - Handlers only read snapshots; nothing here can change the daemon
//! - Runs on the main runtime, never on an IO shard

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::daemon::Daemon;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// Shared state of the monitoring routes.
#[derive(Clone)]
pub struct AdminState {
    pub daemon: Arc<Daemon>,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(daemon: Arc<Daemon>, api_key: &str) -> Router {
    let state = AdminState {
        daemon,
        api_key: Arc::from(api_key),
    };
    Router::new()
        .route("/monitor/daemon", get(get_daemon))
        .route("/monitor/tiers", get(get_tiers))
        .route("/monitor/backends", get(get_backends))
        .route("/monitor/connections", get(get_connections))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
