//! Models that back database entities.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sqlx::FromRow;
use sqlx::Type as SqlxType;
use utoipa::ToSchema;
use uuid::Uuid;

/// The status of a sandbox container record.
///
/// The status is monotone: a record never returns to `Running` after
/// leaving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, SqlxType)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The sandbox container is live and routable.
    Running,
    /// The sandbox container was stopped and removed.
    Stopped,
    /// The exercise inside the sandbox reported completion.
    Completed,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "completed" => Ok(ContainerStatus::Completed),
            _ => Err(format!("invalid container status: {}", s)),
        }
    }
}

/// The difficulty level of an exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, SqlxType)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Level {
    /// Suitable for newcomers.
    Beginner,
    /// Assumes some familiarity.
    Intermediate,
    /// For experienced users.
    Advanced,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Beginner => write!(f, "beginner"),
            Level::Intermediate => write!(f, "intermediate"),
            Level::Advanced => write!(f, "advanced"),
        }
    }
}

impl FromStr for Level {
    type Err = String;

    /// Parses a level, ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "beginner" => Ok(Level::Beginner),
            "intermediate" => Ok(Level::Intermediate),
            "advanced" => Ok(Level::Advanced),
            _ => Err(format!("invalid exercise level: {}", s)),
        }
    }
}

/// The status of a subject's progress on an exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ProgressStatus {
    /// The subject has launched the exercise at least once.
    InProgress,
    /// The exercise reported completion for this subject.
    Completed,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressStatus::InProgress => write!(f, "in_progress"),
            ProgressStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Catalog entry for a buildable exercise image.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct Exercise {
    /// Unique identifier.
    #[sqlx(try_from = "String")]
    pub id: Uuid,
    /// Display name, taken from the bundle's `title`.
    pub name: String,
    /// Version string (default `latest`).
    pub version: String,
    /// Description shown in the catalog.
    pub description: String,
    /// Difficulty level.
    pub level: Level,
    /// Runtime image tag; immutable after creation.
    pub image_tag: String,
    /// Raw bundle metadata; unknown keys are preserved verbatim.
    pub metadata: String,
    /// Timestamp when the exercise was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp when the exercise was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Registry entry for a sandbox container.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct ContainerRecord {
    /// Opaque container id assigned by the runtime.
    pub id: String,
    /// The exercise this sandbox was launched from.
    #[sqlx(try_from = "String")]
    pub exercise_id: Uuid,
    /// The authenticated subject that owns this sandbox.
    pub subject: String,
    /// The unique subdomain that identifies this sandbox externally.
    #[sqlx(try_from = "String")]
    pub subdomain: Uuid,
    /// Current status.
    pub status: ContainerStatus,
    /// Host port the runtime bound to the sandbox's port 8080.
    ///
    /// Present iff the record has ever been running.
    pub host_port: Option<String>,
    /// Timestamp when the sandbox was launched.
    pub created_at: DateTime<Utc>,
    /// Last persisted activity timestamp.
    pub last_activity: DateTime<Utc>,
}

/// Journal entry for an orchestration event.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct EventRecord {
    /// Auto-increment id.
    pub id: i64,
    /// Event kind, e.g. `container.stopped`.
    pub kind: String,
    /// Subject the event pertains to, if any.
    pub subject: Option<String>,
    /// Target entity (container id, exercise id, ...), if any.
    pub target: Option<String>,
    /// JSON-encoded event attributes.
    pub attributes: String,
    /// Timestamp when the event was recorded.
    pub created_at: DateTime<Utc>,
}

/// A subject's progress on an exercise.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct ProgressRecord {
    /// The subject.
    pub subject: String,
    /// The exercise.
    #[sqlx(try_from = "String")]
    pub exercise_id: Uuid,
    /// Progress status.
    pub status: ProgressStatus,
    /// Number of launches.
    pub attempts: i64,
    /// Timestamp of completion, if completed.
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parses_case_insensitively() {
        assert_eq!("beginner".parse::<Level>().unwrap(), Level::Beginner);
        assert_eq!("Beginner".parse::<Level>().unwrap(), Level::Beginner);
        assert_eq!("BEGINNER".parse::<Level>().unwrap(), Level::Beginner);
        assert_eq!(
            "iNtErMeDiAtE".parse::<Level>().unwrap(),
            Level::Intermediate
        );
        assert_eq!("ADVANCED".parse::<Level>().unwrap(), Level::Advanced);
        assert!("expert".parse::<Level>().is_err());
        assert!("".parse::<Level>().is_err());
    }

    #[test]
    fn container_status_round_trips() {
        for status in [
            ContainerStatus::Running,
            ContainerStatus::Stopped,
            ContainerStatus::Completed,
        ] {
            assert_eq!(status.to_string().parse::<ContainerStatus>(), Ok(status));
        }
    }
}
