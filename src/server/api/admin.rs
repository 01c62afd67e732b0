//! Administrative API handlers.

use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::Json;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use utoipa::IntoParams;
use utoipa::ToSchema;

use super::containers::ContainerSummary;
use super::containers::ListContainersResponse;
use super::containers::StopContainerResponse;
use super::error::Error;
use super::send_command;
use super::AppState;
use crate::lifecycle::LifecycleCmd;
use crate::lifecycle::StopReason;
use crate::server::auth::Admin;

/// Query parameters for listing journal events.
#[derive(Debug, Clone, Serialize, Deserialize, IntoParams, ToSchema)]
pub struct ListEventsQueryParams {
    /// Number of events to return (default: `100`, cap: `1000`).
    #[serde(default)]
    pub limit: Option<i64>,
    /// Number of events to skip (default: `0`).
    #[serde(default)]
    pub offset: Option<i64>,
}

/// One journal event in an API response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    /// Journal sequence number.
    pub id: i64,
    /// Event kind, e.g. `container.stopped`.
    pub kind: String,
    /// Subject the event pertains to, if any.
    pub subject: Option<String>,
    /// Target entity, if any.
    pub target: Option<String>,
    /// Event attributes.
    pub attributes: Value,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

/// The response for a journal listing.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListEventsResponse {
    /// The events, newest first.
    pub events: Vec<EventSummary>,
}

/// List all running sandboxes.
#[utoipa::path(
    get,
    path = "/api/admin/containers",
    responses(
        (status = 200, description = "Containers retrieved", body = ListContainersResponse),
    ),
    tag = "admin"
)]
pub async fn admin_list_containers(
    State(state): State<AppState>,
    Admin(_admin): Admin,
) -> Result<Json<ListContainersResponse>, Error> {
    let records = state.db.list_running().await?;
    let base_domain = &state.config.server.base_domain;

    Ok(Json(ListContainersResponse {
        containers: records
            .into_iter()
            .map(|r| ContainerSummary::from_record(r, base_domain))
            .collect(),
    }))
}

/// Force-stop any sandbox.
#[utoipa::path(
    post,
    path = "/api/admin/containers/{id}/stop",
    params(("id" = String, Path, description = "Container id")),
    responses(
        (status = 200, description = "Sandbox stopped", body = StopContainerResponse),
        (status = 404, description = "Container not found"),
    ),
    tag = "admin"
)]
pub async fn admin_stop_container(
    State(state): State<AppState>,
    Admin(_admin): Admin,
    Path(id): Path<String>,
) -> Result<Json<StopContainerResponse>, Error> {
    send_command(&state.lifecycle_tx, |rx| LifecycleCmd::Stop {
        container_id: id,
        reason: StopReason::Admin,
        owner: None,
        rx,
    })
    .await?;

    Ok(Json(StopContainerResponse { success: true }))
}

/// Page through the orchestration event journal.
#[utoipa::path(
    get,
    path = "/api/admin/events",
    params(ListEventsQueryParams),
    responses(
        (status = 200, description = "Events retrieved", body = ListEventsResponse),
    ),
    tag = "admin"
)]
pub async fn admin_list_events(
    State(state): State<AppState>,
    Admin(_admin): Admin,
    Query(query): Query<ListEventsQueryParams>,
) -> Result<Json<ListEventsResponse>, Error> {
    let events = state.db.list_events(query.limit, query.offset).await?;

    let events = events
        .into_iter()
        .map(|e| EventSummary {
            id: e.id,
            kind: e.kind,
            subject: e.subject,
            target: e.target,
            attributes: serde_json::from_str(&e.attributes).unwrap_or(Value::Null),
            created_at: e.created_at,
        })
        .collect();

    Ok(Json(ListEventsResponse { events }))
}
