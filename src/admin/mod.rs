//! Administrative surface.
//!
//! # Responsibilities
//! - Expose the read accessors (middleware, snapshots, targets, breakers, alerts)
//! - Expose registration, snapshot, rollback and sandbox test calls
//!
//! # Design Decisions
//! - Served on its own bind address; everything except `/health` needs the
//!   bearer API key
//! - Handlers call the same operations as configuration reconciliation

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/middleware", get(list_middleware).post(register_middleware))
        .route("/admin/middleware/{name}", get(get_middleware).delete(unregister_middleware))
        .route(
            "/admin/middleware/{name}/snapshots",
            get(list_snapshots).post(take_snapshot),
        )
        .route("/admin/middleware/{name}/rollback", post(rollback))
        .route("/admin/middleware/{name}/test", post(test_middleware))
        .route("/admin/targets", get(get_targets))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/alerts", get(get_alerts))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .route("/health", get(liveness))
        .merge(protected)
        .with_state(state)
}

/// Serve the admin router until shutdown.
pub async fn serve_admin(
    listener: TcpListener,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    tracing::info!(address = %listener.local_addr()?, "Admin API starting");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}
