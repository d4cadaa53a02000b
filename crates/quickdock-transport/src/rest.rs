//! JSON routes: health, state queries and lifecycle actions.

use axum::{
    Json,
    extract::{Path, State},
};
use quickdock_core::{
    ComposeAction, ComposeError, ContainerAction, ContainerView, EngineHealth, ProjectView,
};
use serde::Serialize;

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub engine: EngineHealth,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ActionResponse {
    const fn done() -> Self {
        Self {
            ok: true,
            output: None,
        }
    }
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let engine = state.engine.health().await?;
    Ok(Json(HealthResponse { ok: true, engine }))
}

/// `GET /api/projects`
pub async fn list_projects(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProjectView>>, ApiError> {
    let snapshot = state.snapshots().build().await?;
    Ok(Json(snapshot.projects))
}

/// `GET /api/containers`
pub async fn list_containers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ContainerView>>, ApiError> {
    Ok(Json(state.engine.list_containers().await?))
}

/// `POST /api/compose/{project}/{action}`
///
/// The project's working directory is looked up in a fresh snapshot so a
/// project started a moment ago is already addressable.
pub async fn compose_action(
    State(state): State<AppState>,
    Path((project, action)): Path<(String, String)>,
) -> Result<Json<ActionResponse>, ApiError> {
    let action: ComposeAction = action.parse()?;
    let snapshot = state.snapshots().build().await?;
    let view = snapshot
        .project(&project)
        .ok_or_else(|| ComposeError::ProjectNotFound(project.clone()))?;
    let working_dir = view
        .working_dir
        .as_deref()
        .ok_or_else(|| ComposeError::NoWorkingDir(project.clone()))?;

    let output = state.compose.run(working_dir, &project, action).await?;
    tracing::info!(project, action = action.as_str(), "Compose action done");
    Ok(Json(ActionResponse {
        ok: true,
        output: Some(output),
    }))
}

/// `POST /api/container/{container_id}/{action}`
///
/// `remove` is accepted here as well as on the `DELETE` route.
pub async fn container_action(
    State(state): State<AppState>,
    Path((container_id, action)): Path<(String, String)>,
) -> Result<Json<ActionResponse>, ApiError> {
    let action: ContainerAction = action.parse()?;
    state.engine.container_action(&container_id, action).await?;
    tracing::info!(container_id, action = action.as_str(), "Container action done");
    Ok(Json(ActionResponse::done()))
}

/// `DELETE /api/container/{container_id}`
pub async fn remove_container(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    state
        .engine
        .container_action(&container_id, ContainerAction::Remove)
        .await?;
    tracing::info!(container_id, "Container removed");
    Ok(Json(ActionResponse::done()))
}
