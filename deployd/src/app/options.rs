//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;
use tracing::warn;

use crate::step::git::GitOptions;
use crate::step::LocalExecutorOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::secs_to_duration;
use crate::workers::janitor;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Enable local HTTP server
    pub enable_http_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Pipeline limits
    pub pipeline: PipelineOptions,

    /// Local fetch and shell configuration
    pub executor: LocalExecutorOptions,

    /// Enable the workspace janitor
    pub enable_janitor: bool,

    /// Janitor worker options
    pub janitor: janitor::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            enable_http_server: true,
            server: ServerOptions::default(),
            pipeline: PipelineOptions::default(),
            executor: LocalExecutorOptions::default(),
            enable_janitor: true,
            janitor: janitor::Options::default(),
        }
    }
}

impl AppOptions {
    /// Assemble options from a settings file
    pub fn from_settings(settings: &Settings) -> Self {
        let token = settings.git.token_env.as_ref().and_then(|var| match std::env::var(var) {
            Ok(value) if !value.is_empty() => Some(SecretString::from(value)),
            _ => {
                warn!("Git token variable {} is not set", var);
                None
            }
        });

        Self {
            storage: StorageOptions {
                layout: StorageLayout::with_settings(&settings.storage),
                persist: settings.storage.persist,
            },
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            pipeline: PipelineOptions {
                command_timeout: secs_to_duration(settings.pipeline.command_timeout_secs),
                deploy_timeout: secs_to_duration(settings.pipeline.deploy_timeout_secs),
                output_tail_lines: settings.pipeline.output_tail_lines,
                max_concurrent_deploys: settings.pipeline.max_concurrent_deploys,
            },
            executor: LocalExecutorOptions {
                git: GitOptions {
                    binary: settings.git.binary.clone(),
                    token,
                },
                shell: settings.shell.clone(),
            },
            enable_janitor: settings.janitor.enabled,
            janitor: janitor::Options {
                interval: Duration::from_secs(settings.janitor.interval_secs.max(1)),
                max_age: Duration::from_secs(settings.janitor.max_age_secs),
            },
            ..Default::default()
        }
    }
}

/// Lifecycle options for the service
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Keep deploy records on disk
    pub persist: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            persist: true,
        }
    }
}

/// Pipeline limits
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub command_timeout: Option<Duration>,
    pub deploy_timeout: Option<Duration>,
    pub output_tail_lines: usize,

    /// Zero runs every deploy at once
    pub max_concurrent_deploys: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            command_timeout: Some(Duration::from_secs(1800)),
            deploy_timeout: None,
            output_tail_lines: 20,
            max_concurrent_deploys: 4,
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
