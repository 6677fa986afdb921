//! Deploy API models
//!
//! JSON bodies use camelCase field names. Status values are the capitalized
//! variant names (`"Pending"`, `"Running"`, `"Succeeded"`, `"Failed"`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Body of `POST /deploys`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeployRequest {
    pub repo_url: String,
    pub branch: String,
    pub build_commands: Vec<BuildCommandRequest>,
    pub build_output: String,
    pub site_name: String,
    #[serde(default)]
    pub application_path: Option<String>,
    #[serde(default)]
    pub application_name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

/// One build command of a deploy request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCommandRequest {
    /// Shell command text
    #[serde(alias = "command")]
    pub comando: String,

    #[serde(default)]
    pub terminal_id: Option<String>,

    /// Explicit execution order. Either every command carries one or none does.
    #[serde(default)]
    pub order: Option<u32>,
}

/// Response of `POST /deploys`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployCreatedResponse {
    pub id: Uuid,
    pub status: String,
}

/// Current state of a deploy, returned by `GET /deploys/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploySummaryResponse {
    pub id: Uuid,
    pub site_name: String,
    pub application_name: Option<String>,
    pub application_path: Option<String>,
    pub repo_url: String,
    pub branch: String,
    pub build_output: String,
    pub platform: Option<String>,
    pub requested_by: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub commands: Vec<CommandSummaryResponse>,
}

/// Per-command status inside a deploy summary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSummaryResponse {
    pub order: u32,
    pub comando: String,
    pub terminal_id: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// One audit entry, returned by `GET /deploys/{id}/history`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntryResponse {
    pub occurred_at: DateTime<Utc>,
    pub status: String,
    pub message: Option<String>,
}

/// Response of `GET /deploys`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployListResponse {
    pub deploys: Vec<DeployListItem>,
    pub total: usize,
}

/// Compact deploy row used by listings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployListItem {
    pub id: Uuid,
    pub site_name: String,
    pub branch: String,
    pub status: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Query string of `GET /deploys`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployListQuery {
    pub site: Option<String>,
}

/// Error body returned for every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
