//! Deploy models

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::fsm::Status;
use crate::errors::ServiceError;

/// Opaque deploy identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeployId(Uuid);

impl DeployId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DeployId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for DeployId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeployId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeployId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Request-scoped caller information
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Initiating actor, as reported by the caller
    pub requested_by: Option<String>,
}

/// A deploy submission
#[derive(Debug, Clone, Default)]
pub struct DeploySpec {
    pub site_name: String,
    pub application_name: Option<String>,
    pub application_path: Option<String>,
    pub repo_url: String,
    pub branch: String,
    pub build_output_path: String,
    pub platform: Option<String>,
    pub commands: Vec<CommandSpec>,
}

/// One command of a deploy submission
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Caller-assigned order; assigned from the list index when absent
    pub order: Option<u32>,
    pub command_text: String,
    pub terminal_id: Option<String>,
}

impl CommandSpec {
    pub fn new(command_text: impl Into<String>) -> Self {
        Self {
            order: None,
            command_text: command_text.into(),
            terminal_id: None,
        }
    }
}

/// One ordered build/deploy step of a deploy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployCommand {
    pub order: u32,
    pub command_text: String,
    pub terminal_id: Option<String>,
    pub status: Status,
    pub message: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// Immutable audit record of an aggregate status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployHistoryEntry {
    pub occurred_at: DateTime<Utc>,
    pub status: Status,
    pub message: Option<String>,
}

/// A deploy and its full execution record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deploy {
    pub id: DeployId,
    pub site_name: String,
    pub application_name: Option<String>,
    pub application_path: Option<String>,
    pub repo_url: String,
    pub branch: String,
    pub build_output_path: String,
    pub platform: Option<String>,
    pub requested_by: Option<String>,
    pub status: Status,
    pub message: Option<String>,
    /// Sorted by ascending `order`
    pub commands: Vec<DeployCommand>,
    pub history: Vec<DeployHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Deploy {
    /// Build a pending deploy from a validated submission
    pub fn new(spec: DeploySpec, context: &RequestContext) -> Result<Self, ServiceError> {
        spec.validate()?;

        let explicit = spec.commands.iter().all(|c| c.order.is_some());
        let mut commands: Vec<DeployCommand> = spec
            .commands
            .into_iter()
            .enumerate()
            .map(|(index, command)| DeployCommand {
                order: if explicit {
                    command.order.unwrap_or(index as u32)
                } else {
                    index as u32
                },
                command_text: command.command_text.trim().to_string(),
                terminal_id: command.terminal_id.filter(|t| !t.trim().is_empty()),
                status: Status::Pending,
                message: None,
                executed_at: None,
            })
            .collect();
        commands.sort_by_key(|c| c.order);

        Ok(Self {
            id: DeployId::new(),
            site_name: spec.site_name.trim().to_string(),
            application_name: spec.application_name.filter(|n| !n.trim().is_empty()),
            application_path: spec
                .application_path
                .map(|p| p.trim().trim_matches('/').trim().to_string())
                .filter(|p| !p.is_empty()),
            repo_url: spec.repo_url.trim().to_string(),
            branch: spec.branch.trim().to_string(),
            build_output_path: spec.build_output_path.trim().to_string(),
            platform: spec.platform.filter(|p| !p.trim().is_empty()),
            requested_by: context.requested_by.clone(),
            status: Status::Pending,
            message: None,
            commands,
            history: Vec::new(),
            created_at: Utc::now(),
            updated_at: None,
        })
    }

    /// Stamp the modification time
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn command(&self, order: u32) -> Option<&DeployCommand> {
        self.commands.iter().find(|c| c.order == order)
    }

    pub fn command_mut(&mut self, order: u32) -> Option<&mut DeployCommand> {
        self.commands.iter_mut().find(|c| c.order == order)
    }

    /// Command currently marked running, if any
    pub fn running_command(&self) -> Option<&DeployCommand> {
        self.commands.iter().find(|c| c.status == Status::Running)
    }

    /// Hosting target: `<publish_root>/<site_name>[/<application_path>]`
    pub fn target_path(&self, publish_root: &Path) -> PathBuf {
        let site = publish_root.join(&self.site_name);
        match &self.application_path {
            Some(app) => site.join(app),
            None => site,
        }
    }
}

/// Read-only view of a deploy's current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploySummary {
    pub id: DeployId,
    pub site_name: String,
    pub application_name: Option<String>,
    pub application_path: Option<String>,
    pub repo_url: String,
    pub branch: String,
    pub build_output_path: String,
    pub platform: Option<String>,
    pub requested_by: Option<String>,
    pub status: Status,
    pub message: Option<String>,
    pub commands: Vec<DeployCommand>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Deploy> for DeploySummary {
    fn from(deploy: &Deploy) -> Self {
        Self {
            id: deploy.id,
            site_name: deploy.site_name.clone(),
            application_name: deploy.application_name.clone(),
            application_path: deploy.application_path.clone(),
            repo_url: deploy.repo_url.clone(),
            branch: deploy.branch.clone(),
            build_output_path: deploy.build_output_path.clone(),
            platform: deploy.platform.clone(),
            requested_by: deploy.requested_by.clone(),
            status: deploy.status,
            message: deploy.message.clone(),
            commands: deploy.commands.clone(),
            created_at: deploy.created_at,
            updated_at: deploy.updated_at,
        }
    }
}

/// Listing filter
#[derive(Debug, Clone, Default)]
pub struct DeployFilter {
    pub site_name: Option<String>,
}

impl DeployFilter {
    pub fn matches(&self, deploy: &Deploy) -> bool {
        match &self.site_name {
            Some(site) => deploy.site_name == *site,
            None => true,
        }
    }
}

// ================================ VALIDATION ==================================== //

impl DeploySpec {
    /// Reject malformed submissions before anything is stored
    pub fn validate(&self) -> Result<(), ServiceError> {
        validate_repo_url(&self.repo_url)?;
        validate_branch(&self.branch)?;
        validate_site_name(&self.site_name)?;
        validate_relative_path("buildOutput", &self.build_output_path, false)?;
        if let Some(app_path) = &self.application_path {
            validate_relative_path("applicationPath", app_path, true)?;
        }
        validate_commands(&self.commands)
    }
}

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::ValidationError(message.into())
}

fn validate_repo_url(repo_url: &str) -> Result<(), ServiceError> {
    let repo_url = repo_url.trim();
    if repo_url.is_empty() {
        return Err(invalid("repoUrl is required"));
    }
    if repo_url.starts_with('-') || repo_url.chars().any(char::is_whitespace) {
        return Err(invalid(format!("repoUrl is malformed: {repo_url}")));
    }

    match url::Url::parse(repo_url) {
        Ok(url) => match url.scheme() {
            "http" | "https" | "ssh" | "git" | "file" => Ok(()),
            scheme => Err(invalid(format!("repoUrl scheme not supported: {scheme}"))),
        },
        // scp-like syntax: user@host:path
        Err(_) if is_scp_like(repo_url) => Ok(()),
        Err(e) => Err(invalid(format!("repoUrl is malformed: {e}"))),
    }
}

fn is_scp_like(repo_url: &str) -> bool {
    match repo_url.split_once(':') {
        Some((host, path)) => {
            !host.is_empty() && !host.contains('/') && host.contains('@') && !path.is_empty()
        }
        None => false,
    }
}

fn validate_branch(branch: &str) -> Result<(), ServiceError> {
    let branch = branch.trim();
    if branch.is_empty() {
        return Err(invalid("branch is required"));
    }
    if branch.starts_with('-') || branch.contains("..") || branch.chars().any(char::is_whitespace) {
        return Err(invalid(format!("branch is malformed: {branch}")));
    }
    Ok(())
}

fn validate_site_name(site_name: &str) -> Result<(), ServiceError> {
    let site_name = site_name.trim();
    if site_name.is_empty() {
        return Err(invalid("siteName is required"));
    }
    let allowed = site_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !allowed || site_name == "." || site_name == ".." {
        return Err(invalid(format!(
            "siteName may only contain letters, digits, '-', '_' and '.': {site_name}"
        )));
    }
    Ok(())
}

fn validate_relative_path(field: &str, value: &str, allow_empty: bool) -> Result<(), ServiceError> {
    let value = value.trim();
    if value.is_empty() {
        return if allow_empty {
            Ok(())
        } else {
            Err(invalid(format!("{field} is required")))
        };
    }

    let path = Path::new(value.trim_start_matches('/'));
    if Path::new(value).is_absolute() && field == "buildOutput" {
        return Err(invalid(format!("{field} must be relative: {value}")));
    }
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(invalid(format!("{field} must stay inside its root: {value}")));
    }
    Ok(())
}

fn validate_commands(commands: &[CommandSpec]) -> Result<(), ServiceError> {
    if commands.is_empty() {
        return Err(invalid("buildCommands must contain at least one command"));
    }

    if let Some(index) = commands.iter().position(|c| c.command_text.trim().is_empty()) {
        return Err(invalid(format!("buildCommands[{index}] is empty")));
    }

    let with_order = commands.iter().filter(|c| c.order.is_some()).count();
    if with_order != 0 && with_order != commands.len() {
        return Err(invalid(
            "buildCommands must either all carry an order or none of them",
        ));
    }

    let mut seen = HashSet::new();
    for order in commands.iter().filter_map(|c| c.order) {
        if !seen.insert(order) {
            return Err(invalid(format!("duplicate command order: {order}")));
        }
    }

    Ok(())
}
