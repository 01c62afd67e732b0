//! Exercise catalog API handlers.

use std::collections::HashMap;

use axum::extract::multipart::MultipartError;
use axum::extract::Multipart;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use super::error::Error;
use super::send_command;
use super::AppState;
use crate::db::Level;
use crate::db::ProgressStatus;
use crate::events::EventKind;
use crate::lifecycle::LifecycleCmd;
use crate::server::auth::Admin;
use crate::server::auth::Subject;

/// Multipart field carrying the bundle archive.
const BUNDLE_FIELD: &str = "exercise";

/// Maps multipart read failures, preserving the payload-too-large case.
fn multipart_error(e: MultipartError) -> Error {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        Error::PayloadTooLarge(e.body_text())
    } else {
        Error::BadRequest(format!("malformed multipart body: {}", e.body_text()))
    }
}

/// Summary of a built exercise image.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ImageSummary {
    /// Exercise name.
    pub name: String,
    /// Exercise version.
    pub version: String,
    /// Image tag in the runtime.
    pub tag: String,
}

/// The response for a bundle upload.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    /// The built image.
    pub image: ImageSummary,
}

/// One catalog entry with the caller's progress folded in.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseSummary {
    /// Exercise id.
    pub id: Uuid,
    /// Exercise name.
    pub name: String,
    /// Exercise version.
    pub version: String,
    /// Exercise description.
    pub description: String,
    /// Difficulty level.
    pub level: Level,
    /// Image tag.
    pub image_tag: String,
    /// The caller's progress status, if any.
    pub status: Option<ProgressStatus>,
    /// The caller's launch attempts.
    pub attempts: i64,
    /// When the exercise was added to the catalog.
    pub created_at: DateTime<Utc>,
}

/// The response for a catalog listing.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListExercisesResponse {
    /// The exercises.
    pub exercises: Vec<ExerciseSummary>,
}

/// The response for an exercise deletion.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteExerciseResponse {
    /// Always `true` on success.
    pub success: bool,
}

/// The response for a sandbox launch.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LaunchExerciseResponse {
    /// The runtime container id.
    pub container_id: String,
    /// The sandbox hostname, `<uuid>.<base-domain>`.
    pub subdomain: String,
}

/// Upload an exercise bundle and build its image.
#[utoipa::path(
    post,
    path = "/api/exercises/upload",
    responses(
        (status = 200, description = "Bundle built and cataloged", body = UploadResponse),
        (status = 400, description = "Invalid bundle or failed build"),
        (status = 413, description = "Bundle exceeds the size cap"),
    ),
    tag = "exercises"
)]
pub async fn upload_exercise(
    State(state): State<AppState>,
    Admin(admin): Admin,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, Error> {
    let mut bundle = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some(BUNDLE_FIELD) {
            let filename = field.file_name().unwrap_or_default().to_string();
            let data = field.bytes().await.map_err(multipart_error)?;
            bundle = Some((filename, data));
        }
    }

    let (filename, data) = bundle.ok_or_else(|| {
        Error::BadRequest(format!("multipart field `{BUNDLE_FIELD}` is required"))
    })?;

    let cap = state.config.server.upload_max_size;
    if data.len() > cap {
        return Err(Error::PayloadTooLarge(format!(
            "bundle is {} bytes; the limit is {cap}",
            data.len()
        )));
    }

    let exercise = state.builder.build(&filename, data, &admin.id).await?;

    Ok(Json(UploadResponse {
        image: ImageSummary {
            name: exercise.name,
            version: exercise.version,
            tag: exercise.image_tag,
        },
    }))
}

/// List the catalog with the caller's progress.
#[utoipa::path(
    get,
    path = "/api/exercises",
    responses(
        (status = 200, description = "Catalog retrieved", body = ListExercisesResponse),
    ),
    tag = "exercises"
)]
pub async fn list_exercises(
    State(state): State<AppState>,
    subject: Subject,
) -> Result<Json<ListExercisesResponse>, Error> {
    let exercises = state.db.list_exercises().await?;
    let progress: HashMap<Uuid, _> = state
        .db
        .list_progress_by_subject(&subject.id)
        .await?
        .into_iter()
        .map(|p| (p.exercise_id, p))
        .collect();

    let exercises = exercises
        .into_iter()
        .map(|e| {
            let p = progress.get(&e.id);
            ExerciseSummary {
                id: e.id,
                name: e.name,
                version: e.version,
                description: e.description,
                level: e.level,
                image_tag: e.image_tag,
                status: p.map(|p| p.status),
                attempts: p.map(|p| p.attempts).unwrap_or(0),
                created_at: e.created_at,
            }
        })
        .collect();

    Ok(Json(ListExercisesResponse { exercises }))
}

/// Delete an exercise and its underlying image.
#[utoipa::path(
    delete,
    path = "/api/exercises/{id}",
    params(("id" = Uuid, Path, description = "Exercise id")),
    responses(
        (status = 200, description = "Exercise deleted", body = DeleteExerciseResponse),
        (status = 404, description = "Exercise not found"),
    ),
    tag = "exercises"
)]
pub async fn delete_exercise(
    State(state): State<AppState>,
    Admin(admin): Admin,
    Path(id): Path<Uuid>,
) -> Result<Json<DeleteExerciseResponse>, Error> {
    let exercise = state
        .db
        .get_exercise(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("exercise not found: `{id}`")))?;

    state.db.delete_exercise(id).await?;

    // Best-effort: the image may be gone or still in use by a sandbox.
    if let Err(e) = state.runtime.remove_image(&exercise.image_tag).await {
        warn!(tag = %exercise.image_tag, error = %e, "failed to remove exercise image");
    }

    state
        .journal
        .record(
            EventKind::ImageDeleted,
            Some(&admin.id),
            Some(&id.to_string()),
            json!({ "tag": exercise.image_tag }),
        )
        .await;

    Ok(Json(DeleteExerciseResponse { success: true }))
}

/// Launch a sandbox for an exercise.
#[utoipa::path(
    post,
    path = "/api/exercises/launch/{id}",
    params(("id" = Uuid, Path, description = "Exercise id")),
    responses(
        (status = 200, description = "Sandbox launched", body = LaunchExerciseResponse),
        (status = 400, description = "Already running or quota exceeded"),
        (status = 404, description = "Exercise not found"),
    ),
    tag = "exercises"
)]
pub async fn launch_exercise(
    State(state): State<AppState>,
    subject: Subject,
    Path(id): Path<Uuid>,
) -> Result<Json<LaunchExerciseResponse>, Error> {
    let response = send_command(&state.lifecycle_tx, |rx| LifecycleCmd::Launch {
        subject: subject.id,
        exercise_id: id,
        rx,
    })
    .await?;

    Ok(Json(LaunchExerciseResponse {
        container_id: response.container_id,
        subdomain: format!(
            "{}.{}",
            response.subdomain, state.config.server.base_domain
        ),
    }))
}
