//! Deployment endpoints.
//!
//! The same orchestrator operations the deploy socket offers, for callers
//! that only speak HTTP.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use devroom_auth::TokenVerifier;
use devroom_control::{Deployment, DeploymentStatus, StartDeployment};
use devroom_core::{DeploymentId, ProjectId, RoomId, UserId};
use devroom_store::{DeployLogLine, DeploymentConfig, Store};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::GatewayState;

// =============================================================================
// Request/Response Types
// =============================================================================

/// A deployment as returned to clients.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResponse {
    /// Deployment ID.
    pub deployment_id: DeploymentId,
    /// Project.
    pub project_id: ProjectId,
    /// Room receiving progress events.
    pub room_id: RoomId,
    /// Who started it.
    pub user_id: UserId,
    /// Provider identifier.
    pub provider: String,
    /// Current status.
    pub status: DeploymentStatus,
    /// Percent complete.
    pub progress: u8,
    /// Log lines so far.
    pub logs: Vec<LogLine>,
    /// Published URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// End timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// One deployment log line.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    /// When.
    pub at: DateTime<Utc>,
    /// Status at the time.
    pub status: DeploymentStatus,
    /// Progress at the time.
    pub progress: u8,
    /// Text.
    pub message: String,
}

impl From<DeployLogLine> for LogLine {
    fn from(line: DeployLogLine) -> Self {
        Self {
            at: line.at,
            status: line.status,
            progress: line.progress,
            message: line.message,
        }
    }
}

impl From<Deployment> for DeploymentResponse {
    fn from(deployment: Deployment) -> Self {
        Self {
            deployment_id: deployment.deployment_id,
            project_id: deployment.project_id,
            room_id: deployment.room_id,
            user_id: deployment.user_id,
            provider: deployment.provider,
            status: deployment.status,
            progress: deployment.progress,
            logs: deployment.logs.into_iter().map(LogLine::from).collect(),
            url: deployment.url,
            error: deployment.error,
            started_at: deployment.started_at,
            finished_at: deployment.finished_at,
        }
    }
}

/// Response for deployment history.
#[derive(Debug, Serialize)]
pub struct ListDeploymentsResponse {
    /// Newest first.
    pub deployments: Vec<DeploymentResponse>,
}

/// Query parameters for deployment history.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Page size (1-100).
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Request to start a deployment.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDeploymentBody {
    /// Room receiving progress events.
    pub room_id: RoomId,
    /// Provider identifier.
    #[serde(default)]
    pub provider: Option<String>,
    /// Build settings.
    #[serde(default)]
    pub config: DeploymentConfig,
}

// =============================================================================
// Handlers
// =============================================================================

/// Get a deployment's live status.
///
/// # Errors
///
/// Returns an error if the deployment is unknown or was evicted, or the
/// caller has no access to its project.
pub async fn get_deployment<S, V>(
    State(state): State<Arc<GatewayState<S, V>>>,
    user: AuthUser,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    let deployment_id = parse_id::<DeploymentId>(&deployment_id, "deployment")?;
    let deployment = state
        .engine
        .deploy()
        .get_status(&user.user_id, &deployment_id)?;

    Ok(Json(DeploymentResponse::from(deployment)))
}

/// Cancel a pending or building deployment.
///
/// # Errors
///
/// Returns `409` if the deployment is past the cancellable stages.
pub async fn cancel_deployment<S, V>(
    State(state): State<Arc<GatewayState<S, V>>>,
    user: AuthUser,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    let deployment_id = parse_id::<DeploymentId>(&deployment_id, "deployment")?;
    let deployment = state
        .engine
        .deploy()
        .cancel(&user.user_id, &deployment_id)?;

    tracing::info!(
        deployment_id = %deployment_id,
        user_id = %user.user_id,
        "Deployment cancelled over HTTP"
    );

    Ok(Json(DeploymentResponse::from(deployment)))
}

/// List a project's deployments, newest first.
///
/// # Errors
///
/// Returns an error if the caller has no access to the project.
pub async fn list_deployments<S, V>(
    State(state): State<Arc<GatewayState<S, V>>>,
    user: AuthUser,
    Path(project_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError>
where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    let project_id = parse_id::<ProjectId>(&project_id, "project")?;
    let deployments = state
        .engine
        .deploy()
        .history(&user.user_id, &project_id, query.limit)?;

    Ok(Json(ListDeploymentsResponse {
        deployments: deployments
            .into_iter()
            .map(DeploymentResponse::from)
            .collect(),
    }))
}

/// Start a deployment of a project.
///
/// # Errors
///
/// Returns an error if the caller cannot write to the project's room or the
/// build command is malformed.
pub async fn start_deployment<S, V>(
    State(state): State<Arc<GatewayState<S, V>>>,
    user: AuthUser,
    Path(project_id): Path<String>,
    Json(body): Json<StartDeploymentBody>,
) -> Result<impl IntoResponse, ApiError>
where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    let project_id = parse_id::<ProjectId>(&project_id, "project")?;
    let request = StartDeployment {
        room_id: body.room_id,
        project_id,
        provider: body.provider.unwrap_or_else(|| "static".to_string()),
        config: body.config,
    };

    let deployment = state.engine.deploy().start(&user.user_id, request)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeploymentResponse::from(deployment)),
    ))
}

/// Parse an ID path segment.
fn parse_id<T: std::str::FromStr>(s: &str, what: &str) -> Result<T, ApiError> {
    s.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {what} ID: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_rejects_garbage() {
        assert!(parse_id::<DeploymentId>("not-an-id", "deployment").is_err());
        let id = DeploymentId::generate();
        assert_eq!(
            parse_id::<DeploymentId>(&id.to_string(), "deployment").unwrap(),
            id
        );
    }

    #[test]
    fn response_is_camel_case() {
        let deployment = Deployment {
            deployment_id: DeploymentId::generate(),
            project_id: ProjectId::generate(),
            room_id: RoomId::generate(),
            user_id: UserId::generate(),
            provider: "static".to_string(),
            config: DeploymentConfig::default(),
            status: DeploymentStatus::Pending,
            progress: 0,
            logs: Vec::new(),
            url: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };

        let json = serde_json::to_value(DeploymentResponse::from(deployment)).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json["deploymentId"].is_string());
        assert!(json.get("url").is_none());
    }
}
