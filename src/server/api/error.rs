//! API error types.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

use crate::builder::BuildBundleError;
use crate::db::DatabaseError;
use crate::lifecycle::svc::CompleteError;
use crate::lifecycle::svc::LaunchError;
use crate::lifecycle::svc::ReconcileError;
use crate::lifecycle::svc::StopError;

/// An API error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Error kind.
    pub kind: String,
    /// Error message.
    pub message: String,
}

/// An API error type.
///
/// Variants are the error kinds surfaced to callers; each maps onto a
/// status code and a `{kind, message}` JSON body.
#[derive(Debug)]
pub enum Error {
    /// A sandbox for the exercise is already running (`400`).
    AlreadyRunning(String),
    /// The subject's concurrent sandbox quota is exhausted (`400`).
    QuotaExceeded(String),
    /// The exercise does not exist (`404`).
    UnknownExercise(String),
    /// The uploaded bundle is malformed (`400`).
    InvalidBundle(String),
    /// The runtime failed to build the bundle image (`400`).
    BuildFailed(String),
    /// A container or subdomain was not found (`404`).
    NotFound(String),
    /// The caller lacks permission (`403`).
    Forbidden(String),
    /// The caller is not authenticated (`401`).
    Unauthorized(String),
    /// The container runtime cannot be reached (`503`).
    RuntimeUnavailable(String),
    /// The runtime refused a create or start request (`502`).
    RuntimeRefused(String),
    /// The upload exceeds the configured size cap (`413`).
    PayloadTooLarge(String),
    /// A malformed request (`400`).
    BadRequest(String),
    /// An internal server error (`500`).
    Internal,
}

impl Error {
    /// The kind string surfaced in the response body.
    fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyRunning(_) => "AlreadyRunning",
            Self::QuotaExceeded(_) => "QuotaExceeded",
            Self::UnknownExercise(_) => "UnknownExercise",
            Self::InvalidBundle(_) => "InvalidBundle",
            Self::BuildFailed(_) => "BuildFailed",
            Self::NotFound(_) => "NotFound",
            Self::Forbidden(_) => "Forbidden",
            Self::Unauthorized(_) => "Unauthorized",
            Self::RuntimeUnavailable(_) => "RuntimeUnavailable",
            Self::RuntimeRefused(_) => "RuntimeRefused",
            Self::PayloadTooLarge(_) => "PayloadTooLarge",
            Self::BadRequest(_) => "BadRequest",
            Self::Internal => "Internal",
        }
    }

    /// The HTTP status this error responds with.
    fn status(&self) -> StatusCode {
        match self {
            Self::AlreadyRunning(_)
            | Self::QuotaExceeded(_)
            | Self::InvalidBundle(_)
            | Self::BuildFailed(_)
            | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnknownExercise(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RuntimeRefused(_) => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Consumes the error, yielding the caller-facing message.
    ///
    /// Internal failure details never reach the response; callers get a
    /// fixed placeholder while the specifics go to the log.
    fn into_message(self) -> String {
        match self {
            Self::AlreadyRunning(m)
            | Self::QuotaExceeded(m)
            | Self::UnknownExercise(m)
            | Self::InvalidBundle(m)
            | Self::BuildFailed(m)
            | Self::NotFound(m)
            | Self::Forbidden(m)
            | Self::Unauthorized(m)
            | Self::RuntimeUnavailable(m)
            | Self::RuntimeRefused(m)
            | Self::PayloadTooLarge(m)
            | Self::BadRequest(m) => m,
            Self::Internal => String::from("the orchestrator hit an unexpected error"),
        }
    }
}

impl From<DatabaseError> for Error {
    fn from(err: DatabaseError) -> Self {
        error!(error = %err, "database failure surfaced to the API");
        Self::Internal
    }
}

impl From<LaunchError> for Error {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::UnknownExercise(_) => Self::UnknownExercise(err.to_string()),
            LaunchError::AlreadyRunning { .. } => Self::AlreadyRunning(err.to_string()),
            LaunchError::QuotaExceeded { .. } => Self::QuotaExceeded(err.to_string()),
            LaunchError::RuntimeUnavailable(_) => Self::RuntimeUnavailable(err.to_string()),
            LaunchError::RuntimeRefused(_) => Self::RuntimeRefused(err.to_string()),
            LaunchError::Database(err) => err.into(),
        }
    }
}

impl From<StopError> for Error {
    fn from(err: StopError) -> Self {
        match err {
            StopError::NotFound(_) => Self::NotFound(err.to_string()),
            StopError::Forbidden => Self::Forbidden(err.to_string()),
            StopError::Database(err) => err.into(),
        }
    }
}

impl From<CompleteError> for Error {
    fn from(err: CompleteError) -> Self {
        match err {
            CompleteError::NotFound(_) => Self::NotFound(err.to_string()),
            CompleteError::Database(err) => err.into(),
        }
    }
}

impl From<ReconcileError> for Error {
    fn from(err: ReconcileError) -> Self {
        error!(error = %err, "reconciliation failure surfaced to the API");
        Self::Internal
    }
}

impl From<BuildBundleError> for Error {
    fn from(err: BuildBundleError) -> Self {
        match err {
            BuildBundleError::InvalidBundle(_) => Self::InvalidBundle(err.to_string()),
            BuildBundleError::BuildFailed(_) => Self::BuildFailed(err.to_string()),
            BuildBundleError::Runtime(crate::runtime::RuntimeError::Unavailable(_)) => {
                Self::RuntimeUnavailable(err.to_string())
            }
            BuildBundleError::Runtime(_) | BuildBundleError::Io(_) => {
                error!(error = %err, "bundle build failure surfaced to the API");
                Self::Internal
            }
            BuildBundleError::Database(err) => err.into(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind().to_string();

        let body = ErrorResponse {
            kind,
            message: self.into_message(),
        };

        (status, Json(body)).into_response()
    }
}
