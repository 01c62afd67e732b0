//! Sandbox container API handlers.

use axum::body::Bytes;
use axum::extract::Path;
use axum::extract::State;
use axum::Json;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use super::error::Error;
use super::send_command;
use super::AppState;
use crate::db::ContainerRecord;
use crate::db::ContainerStatus;
use crate::lifecycle::LifecycleCmd;
use crate::lifecycle::StopReason;
use crate::server::auth::Subject;

/// One sandbox container in an API response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    /// The runtime container id.
    pub container_id: String,
    /// The exercise the sandbox runs.
    pub exercise_id: Uuid,
    /// The owning subject.
    pub subject: String,
    /// The sandbox hostname, `<uuid>.<base-domain>`.
    pub subdomain: String,
    /// Current status.
    pub status: ContainerStatus,
    /// When the sandbox was launched.
    pub created_at: DateTime<Utc>,
    /// Last persisted activity.
    pub last_activity: DateTime<Utc>,
}

impl ContainerSummary {
    /// Builds a summary, expanding the subdomain into a hostname.
    pub(crate) fn from_record(record: ContainerRecord, base_domain: &str) -> Self {
        Self {
            container_id: record.id,
            exercise_id: record.exercise_id,
            subject: record.subject,
            subdomain: format!("{}.{base_domain}", record.subdomain),
            status: record.status,
            created_at: record.created_at,
            last_activity: record.last_activity,
        }
    }
}

/// The response for a container listing.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListContainersResponse {
    /// The containers.
    pub containers: Vec<ContainerSummary>,
}

/// The response for a stop request.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StopContainerResponse {
    /// Always `true` on success.
    pub success: bool,
}

/// The response for a completion report.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CompleteResponse {
    /// Always `true` on success.
    pub success: bool,
}

/// List the caller's running sandboxes.
#[utoipa::path(
    get,
    path = "/api/containers",
    responses(
        (status = 200, description = "Containers retrieved", body = ListContainersResponse),
    ),
    tag = "containers"
)]
pub async fn list_containers(
    State(state): State<AppState>,
    subject: Subject,
) -> Result<Json<ListContainersResponse>, Error> {
    let records = state.db.list_running_by_subject(&subject.id).await?;
    let base_domain = &state.config.server.base_domain;

    Ok(Json(ListContainersResponse {
        containers: records
            .into_iter()
            .map(|r| ContainerSummary::from_record(r, base_domain))
            .collect(),
    }))
}

/// Stop one of the caller's sandboxes.
#[utoipa::path(
    post,
    path = "/api/containers/{id}/stop",
    params(("id" = String, Path, description = "Container id")),
    responses(
        (status = 200, description = "Sandbox stopped", body = StopContainerResponse),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Container not found"),
    ),
    tag = "containers"
)]
pub async fn stop_container(
    State(state): State<AppState>,
    subject: Subject,
    Path(id): Path<String>,
) -> Result<Json<StopContainerResponse>, Error> {
    send_command(&state.lifecycle_tx, |rx| LifecycleCmd::Stop {
        container_id: id,
        reason: StopReason::User,
        owner: Some(subject.id),
        rx,
    })
    .await?;

    Ok(Json(StopContainerResponse { success: true }))
}

/// Record an exercise completion.
///
/// Called from inside the sandbox via the injected `CALLBACK_URL`; the
/// path parameter is the sandbox's subdomain UUID. Unauthenticated, and
/// idempotent: repeated reports settle on the same terminal state.
#[utoipa::path(
    post,
    path = "/api/containers/{id}/complete",
    params(("id" = String, Path, description = "Sandbox subdomain UUID")),
    request_body(content = Vec<u8>, description = "Raw JSON completion payload"),
    responses(
        (status = 200, description = "Completion recorded", body = CompleteResponse),
        (status = 404, description = "Unknown subdomain"),
    ),
    tag = "containers"
)]
pub async fn complete_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<CompleteResponse>, Error> {
    let subdomain = Uuid::parse_str(&id)
        .map_err(|_| Error::NotFound(format!("no sandbox found for subdomain `{id}`")))?;

    // The payload comes from inside the sandbox; anything unparseable is
    // journaled as null rather than rejected.
    let payload = serde_json::from_slice(&body).unwrap_or(Value::Null);

    send_command(&state.lifecycle_tx, |rx| LifecycleCmd::Complete {
        subdomain,
        payload,
        rx,
    })
    .await?;

    Ok(Json(CompleteResponse { success: true }))
}
