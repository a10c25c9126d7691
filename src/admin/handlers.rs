use axum::{extract::State, Json};

use crate::admin::AdminState;
use crate::daemon::{ConnectionsSnapshot, DaemonSnapshot};
use crate::load_balancer::backend::BackendSnapshot;
use crate::load_balancer::tier::TierSnapshot;

pub async fn get_daemon(State(state): State<AdminState>) -> Json<DaemonSnapshot> {
    Json(state.daemon.snapshot())
}

pub async fn get_tiers(State(state): State<AdminState>) -> Json<Vec<TierSnapshot>> {
    Json(state.daemon.tiers())
}

pub async fn get_backends(State(state): State<AdminState>) -> Json<Vec<BackendSnapshot>> {
    Json(state.daemon.backends())
}

/// Client and upstream connections, clients ordered by id.
pub async fn get_connections(State(state): State<AdminState>) -> Json<ConnectionsSnapshot> {
    Json(state.daemon.connections())
}
