//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::ServiceError;
use crate::server::handlers::{
    cancel_deploy_handler, create_deploy_handler, deploy_history_handler, get_deploy_handler,
    health_handler, list_deploys_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the application router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Deploys
        .route("/deploys", post(create_deploy_handler).get(list_deploys_handler))
        .route("/deploys/{id}", get(get_deploy_handler))
        .route("/deploys/{id}/history", get(deploy_history_handler))
        .route("/deploys/{id}/cancel", post(cancel_deploy_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), ServiceError>>, ServiceError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ServiceError::ServerError(format!("{}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServiceError::ServerError(e.to_string()))
    });

    Ok(handle)
}
