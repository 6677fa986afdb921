//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::{DeployService, Orchestrator, PipelineSettings};
use crate::errors::ServiceError;
use crate::filesys::dir::Dir;
use crate::ledger::store::{DeployStore, JsonFileStore, MemoryStore};
use crate::ledger::Ledger;
use crate::step::{LocalStepExecutor, StepExecutor};

/// Main application state
pub struct AppState {
    /// Deploy records
    pub ledger: Arc<Ledger>,

    /// Pipeline runner
    pub orchestrator: Arc<Orchestrator>,

    /// Facade used by the HTTP layer
    pub service: Arc<DeployService>,

    /// Directory sources are fetched into
    pub workspace: Dir,
}

impl AppState {
    /// Initialize application state with the local step executor
    pub async fn init(options: &AppOptions) -> Result<Self, ServiceError> {
        let workspace = options.storage.layout.workspace_dir();
        let executor = Arc::new(LocalStepExecutor::new(
            workspace.clone(),
            options.executor.clone(),
        ));
        Self::init_with_executor(options, executor).await
    }

    /// Initialize application state around any step executor
    pub async fn init_with_executor(
        options: &AppOptions,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<Self, ServiceError> {
        info!("Initializing application state...");

        let layout = &options.storage.layout;
        layout.setup().await?;

        let store: Arc<dyn DeployStore> = if options.storage.persist {
            Arc::new(JsonFileStore::open(layout.deploys_dir()).await?)
        } else {
            Arc::new(MemoryStore::new())
        };
        let ledger = Arc::new(Ledger::restore(store).await?);

        let settings = PipelineSettings {
            command_timeout: options.pipeline.command_timeout,
            deploy_timeout: options.pipeline.deploy_timeout,
            output_tail_lines: options.pipeline.output_tail_lines,
            publish_root: layout.publish_root().path().to_path_buf(),
        };
        let orchestrator = Arc::new(Orchestrator::new(ledger.clone(), executor, settings));
        let service = Arc::new(DeployService::new(
            orchestrator.clone(),
            Some(options.pipeline.max_concurrent_deploys),
        ));

        Ok(Self {
            ledger,
            orchestrator,
            service,
            workspace: layout.workspace_dir(),
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Shutting down application state...");
        self.service.shutdown().await;
        Ok(())
    }
}
