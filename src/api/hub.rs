//! Notebook hub, training upload, deployment and housekeeping endpoints.
//!
//! Hub calls are blocking (`ureq`), so every handler that talks to the hub
//! runs the call on the blocking pool.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::hub::{
    clear_staged, spawn_deployment, stage_images, HubError, JobState, JobStatus, ServerStart,
    TokenCheck, TrainingImage,
};

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    token: String,
}

pub async fn connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<Value>, ApiError> {
    let hub = state.hub.clone();
    let check = tokio::task::spawn_blocking(move || hub.connect(&request.token))
        .await?
        .map_err(|e| match e {
            HubError::Timeout => ApiError::from_hub(e, "Connection failed"),
            other => ApiError::internal(format!("Connection failed: {}", other)),
        })?;

    let user_name = &state.hub.settings().user;
    match check {
        TokenCheck::Valid(user) => Ok(Json(json!({
            "status": "connected",
            "message": format!("Successfully connected to JupyterHub as {}", user_name),
            "user_info": {
                "name": user.name,
                "admin": user.admin,
                "server_running": user.server_running(),
            },
        }))),
        TokenCheck::Rejected => Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Invalid JupyterHub token",
        )),
        TokenCheck::UserMissing => Err(ApiError::not_found(format!(
            "User '{}' not found on JupyterHub",
            user_name
        ))),
    }
}

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if !state.hub.is_connected() {
        return Ok(Json(json!({
            "status": "disconnected",
            "message": "No token configured",
        })));
    }

    let hub = state.hub.clone();
    let user = tokio::task::spawn_blocking(move || hub.client()?.user()).await?;
    Ok(Json(match user {
        Ok(user) => json!({
            "status": "connected",
            "message": format!("JupyterHub accessible for user {}", user.name),
            "user_info": {
                "name": user.name,
                "server_running": user.server_running(),
                "last_activity": user.last_activity,
            },
        }),
        Err(HubError::Status { .. }) => json!({
            "status": "error",
            "message": "User authentication failed",
        }),
        Err(e) => json!({
            "status": "error",
            "message": format!("Connection error: {}", e),
        }),
    }))
}

pub async fn start_server(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let hub = state.hub.clone();
    let started = tokio::task::spawn_blocking(move || hub.client()?.start_server())
        .await?
        .map_err(|e| match e {
            HubError::Status { code, .. } => ApiError::new(
                StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY),
                "Failed to start server",
            ),
            other => ApiError::from_hub(other, "Server start failed"),
        })?;

    let user = &state.hub.settings().user;
    Ok(Json(match started {
        ServerStart::Starting => json!({
            "status": "starting",
            "message": format!("Server starting for user {}", user),
        }),
        ServerStart::AlreadyRunning => json!({
            "status": "already_running",
            "message": format!("Server already running for {}", user),
        }),
    }))
}

pub async fn upload_training(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    if !state.hub.is_connected() {
        return Err(ApiError::from_hub(HubError::NotConnected, "Upload failed"));
    }

    let mut object_name = None;
    let mut images = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("object_name") => {
                object_name = Some(field.text().await.map_err(|e| {
                    ApiError::bad_request(format!("invalid object_name field: {}", e))
                })?);
            }
            Some("files") => {
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("invalid file part: {}", e)))?;
                images.push(TrainingImage {
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    let object_name =
        object_name.ok_or_else(|| ApiError::bad_request("Missing object_name field"))?;
    if images.is_empty() {
        return Err(ApiError::bad_request("No files uploaded"));
    }

    let hub = state.hub.clone();
    let staged = tokio::task::spawn_blocking(move || {
        stage_images(&hub.settings().upload_dir, &object_name, &images)
    })
    .await?
    .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let hub = state.hub.clone();
    let pushed = staged.clone();
    tokio::task::spawn_blocking(move || pushed.push(&hub.client()?))
        .await?
        .map_err(|e| ApiError::from_hub(e, "Upload failed"))?;

    log::info!(
        "training upload {}: {} images of {}",
        staged.training_id,
        staged.files.len(),
        staged.object_name
    );
    Ok(Json(json!({
        "training_id": staged.training_id,
        "object_name": staged.object_name,
        "files_uploaded": staged.files.len(),
        "message": "Files uploaded successfully to JupyterHub",
    })))
}

fn default_model_type() -> String {
    "rf".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DeploymentRequest {
    #[serde(default = "default_model_type")]
    model_type: String,
}

pub async fn start_deployment(
    State(state): State<AppState>,
    Json(request): Json<DeploymentRequest>,
) -> Result<Json<Value>, ApiError> {
    let code = state
        .hub
        .settings()
        .deploy_code(&request.model_type)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let id = spawn_deployment(state.jobs.clone(), &state.hub, &request.model_type, code)
        .map_err(|e| ApiError::from_hub(e, "Deployment failed"))?;
    log::info!("deployment {} started ({})", id, request.model_type);
    Ok(Json(json!({
        "deployment_id": id,
        "status": "started",
        "message": "Deployment started",
    })))
}

pub async fn deployment_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    state
        .jobs
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Deployment ID not found"))
}

pub async fn system_info(State(state): State<AppState>) -> Json<Value> {
    let settings = state.hub.settings();
    Json(json!({
        "hub_url": settings.url,
        "hub_user": settings.user,
        "edge_device_ip": settings.edge_device_ip,
        "connected": state.hub.is_connected(),
        "active_deployments": state.jobs.count(JobState::Running),
    }))
}

pub async fn cleanup(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let hub = state.hub.clone();
    let removed_uploads =
        tokio::task::spawn_blocking(move || clear_staged(&hub.settings().upload_dir))
            .await?
            .map_err(|e| ApiError::internal(format!("Cleanup failed: {:#}", e)))?;
    let removed_jobs = state.jobs.prune_finished();

    Ok(Json(json!({
        "message": "Cleanup completed",
        "hub_user": state.hub.settings().user,
        "removed_uploads": removed_uploads,
        "removed_jobs": removed_jobs,
    })))
}
