//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::ServiceError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::step::shell::ShellOptions;

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub json_logs: bool,

    /// Also write a daily rolling log file under the data directory
    #[serde(default = "default_true")]
    pub log_to_file: bool,

    /// HTTP listener
    #[serde(default)]
    pub server: ServerSettings,

    /// Pipeline limits
    #[serde(default)]
    pub pipeline: PipelineSettingsFile,

    /// Where deploys, workspaces and sites live
    #[serde(default)]
    pub storage: StorageSettings,

    /// Source fetching
    #[serde(default)]
    pub git: GitSettings,

    /// Shell used for build commands
    #[serde(default)]
    pub shell: ShellOptions,

    /// Workspace janitor
    #[serde(default)]
    pub janitor: JanitorSettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            log_to_file: true,
            server: ServerSettings::default(),
            pipeline: PipelineSettingsFile::default(),
            storage: StorageSettings::default(),
            git: GitSettings::default(),
            shell: ShellOptions::default(),
            janitor: JanitorSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from `file`, falling back to defaults when it does not exist
    pub async fn load(file: &File) -> Result<Self, ServiceError> {
        if !file.exists().await {
            info!("No settings file at {}, using defaults", file.path().display());
            return Ok(Self::default());
        }
        file.read_json::<Settings>().await.map_err(|e| {
            ServiceError::ConfigError(format!("{}: {}", file.path().display(), e))
        })
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Pipeline limits as written in the settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettingsFile {
    /// Per-command limit, zero or absent disables it
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: Option<u64>,

    /// Whole-deploy limit, zero or absent disables it
    #[serde(default)]
    pub deploy_timeout_secs: Option<u64>,

    #[serde(default = "default_output_tail_lines")]
    pub output_tail_lines: usize,

    /// Zero runs every deploy at once
    #[serde(default = "default_max_concurrent_deploys")]
    pub max_concurrent_deploys: usize,
}

fn default_command_timeout() -> Option<u64> {
    Some(1800)
}

fn default_output_tail_lines() -> usize {
    20
}

fn default_max_concurrent_deploys() -> usize {
    4
}

impl Default for PipelineSettingsFile {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            deploy_timeout_secs: None,
            output_tail_lines: default_output_tail_lines(),
            max_concurrent_deploys: default_max_concurrent_deploys(),
        }
    }
}

/// Storage settings, unset paths derive from the data directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub publish_root: Option<PathBuf>,

    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,

    /// Keep deploy records on disk across restarts
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            publish_root: None,
            workspace_dir: None,
            persist: true,
        }
    }
}

/// Git settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSettings {
    #[serde(default = "default_git_binary")]
    pub binary: String,

    /// Environment variable holding an HTTPS access token
    #[serde(default)]
    pub token_env: Option<String>,
}

fn default_git_binary() -> String {
    "git".to_string()
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            token_env: None,
        }
    }
}

/// Janitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_janitor_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_janitor_max_age")]
    pub max_age_secs: u64,
}

fn default_janitor_interval() -> u64 {
    600
}

fn default_janitor_max_age() -> u64 {
    6 * 3600
}

impl Default for JanitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_janitor_interval(),
            max_age_secs: default_janitor_max_age(),
        }
    }
}
