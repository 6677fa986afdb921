//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::ServiceError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::janitor;

/// Run the deploy service until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServiceError> {
    info!("Initializing deploy service...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start deploy service: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, ServiceError> {
    let app_state = Arc::new(AppState::init(options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    if options.enable_janitor {
        init_janitor_worker(
            options.janitor.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.enable_http_server {
        init_http_server(
            options,
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    Ok(app_state)
}

fn init_janitor_worker(
    options: janitor::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ServiceError> {
    info!("Initializing janitor worker...");

    let workspace = app_state.workspace.clone();
    let orchestrator = app_state.orchestrator.clone();

    let janitor_handle = tokio::spawn(async move {
        janitor::run(
            &options,
            &workspace,
            orchestrator,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_janitor_worker_handle(janitor_handle)
}

async fn init_http_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ServiceError> {
    info!("Initializing local HTTP server...");

    let server_state = ServerState::new(app_state.service.clone());

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_http_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    http_server_handle: Option<JoinHandle<Result<(), ServiceError>>>,
    janitor_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            http_server_handle: None,
            janitor_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), ServiceError> {
        if self.app_state.is_some() {
            return Err(ServiceError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_janitor_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ServiceError> {
        if self.janitor_worker_handle.is_some() {
            return Err(ServiceError::ShutdownError("janitor_handle already set".to_string()));
        }
        self.janitor_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_http_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), ServiceError>>,
    ) -> Result<(), ServiceError> {
        if self.http_server_handle.is_some() {
            return Err(ServiceError::ShutdownError("server_handle already set".to_string()));
        }
        self.http_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), ServiceError> {
        info!("Shutting down deploy service...");

        // 1. Janitor worker
        if let Some(handle) = self.janitor_worker_handle.take() {
            handle.await.map_err(|e| ServiceError::ShutdownError(e.to_string()))?;
        }

        // 2. HTTP server
        if let Some(handle) = self.http_server_handle.take() {
            handle.await.map_err(|e| ServiceError::ShutdownError(e.to_string()))??;
        }

        // 3. Running deploys
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
