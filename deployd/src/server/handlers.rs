//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use deploy_api::{
    BuildCommandRequest, CommandSummaryResponse, CreateDeployRequest, DeployCreatedResponse,
    DeployListItem, DeployListQuery, DeployListResponse, DeploySummaryResponse, ErrorResponse,
    HealthResponse, HistoryEntryResponse, VersionResponse,
};
use tracing::{error, warn};

use crate::deploy::fsm::Status;
use crate::errors::ServiceError;
use crate::models::deploy::{
    CommandSpec, DeployCommand, DeployFilter, DeployHistoryEntry, DeployId, DeploySpec,
    DeploySummary, RequestContext,
};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Header naming the actor behind a submission
pub const REQUESTED_BY_HEADER: &str = "x-requested-by";

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// `POST /deploys`
pub async fn create_deploy_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateDeployRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let Json(request) = payload.map_err(|e| ServiceError::ValidationError(e.body_text()))?;

    let context = RequestContext {
        requested_by: headers
            .get(REQUESTED_BY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string),
    };

    let id = state.service.submit(spec_from_request(request), &context).await?;
    Ok((
        StatusCode::CREATED,
        Json(DeployCreatedResponse {
            id: id.as_uuid(),
            status: Status::Pending.as_str().to_string(),
        }),
    ))
}

/// `GET /deploys`
pub async fn list_deploys_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<DeployListQuery>,
) -> impl IntoResponse {
    let filter = DeployFilter {
        site_name: query.site.filter(|s| !s.is_empty()),
    };
    let deploys: Vec<DeployListItem> = state
        .service
        .list(&filter)
        .await
        .into_iter()
        .map(|summary| DeployListItem {
            id: summary.id.as_uuid(),
            site_name: summary.site_name,
            branch: summary.branch,
            status: summary.status.as_str().to_string(),
            message: summary.message,
            created_at: summary.created_at,
        })
        .collect();

    Json(DeployListResponse {
        total: deploys.len(),
        deploys,
    })
}

/// `GET /deploys/{id}`
pub async fn get_deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let summary = state.service.get_status(parse_id(&id)?).await?;
    Ok(Json(summary_response(summary)))
}

/// `GET /deploys/{id}/history`
pub async fn deploy_history_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let history = state.service.get_history(parse_id(&id)?).await?;
    let entries: Vec<HistoryEntryResponse> = history.into_iter().map(history_response).collect();
    Ok(Json(entries))
}

/// `POST /deploys/{id}/cancel`
pub async fn cancel_deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    state.service.cancel(id).await?;
    let summary = state.service.get_status(id).await?;
    Ok((StatusCode::ACCEPTED, Json(summary_response(summary))))
}

// Unparseable ids cannot name a deploy
fn parse_id(raw: &str) -> Result<DeployId, ServiceError> {
    raw.parse()
        .map_err(|_| ServiceError::NotFound(format!("deploy {}", raw)))
}

fn spec_from_request(request: CreateDeployRequest) -> DeploySpec {
    DeploySpec {
        site_name: request.site_name,
        application_name: request.application_name,
        application_path: request.application_path,
        repo_url: request.repo_url,
        branch: request.branch,
        build_output_path: request.build_output,
        platform: request.platform,
        commands: request
            .build_commands
            .into_iter()
            .map(|c: BuildCommandRequest| CommandSpec {
                order: c.order,
                command_text: c.comando,
                terminal_id: c.terminal_id,
            })
            .collect(),
    }
}

fn summary_response(summary: DeploySummary) -> DeploySummaryResponse {
    DeploySummaryResponse {
        id: summary.id.as_uuid(),
        site_name: summary.site_name,
        application_name: summary.application_name,
        application_path: summary.application_path,
        repo_url: summary.repo_url,
        branch: summary.branch,
        build_output: summary.build_output_path,
        platform: summary.platform,
        requested_by: summary.requested_by,
        status: summary.status.as_str().to_string(),
        message: summary.message,
        created_at: summary.created_at,
        updated_at: summary.updated_at,
        commands: summary.commands.into_iter().map(command_response).collect(),
    }
}

fn command_response(command: DeployCommand) -> CommandSummaryResponse {
    CommandSummaryResponse {
        order: command.order,
        comando: command.command_text,
        terminal_id: command.terminal_id,
        status: command.status.as_str().to_string(),
        message: command.message,
        executed_at: command.executed_at,
    }
}

fn history_response(entry: DeployHistoryEntry) -> HistoryEntryResponse {
    HistoryEntryResponse {
        occurred_at: entry.occurred_at,
        status: entry.status.as_str().to_string(),
        message: entry.message,
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ServiceError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ServiceError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ServiceError::ShutdownError(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }

        let message = match self {
            ServiceError::ValidationError(m)
            | ServiceError::NotFound(m)
            | ServiceError::Conflict(m) => m,
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
