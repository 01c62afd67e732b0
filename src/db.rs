//! Database schema and operations for the catalog, registry, journal, and
//! progress stores.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

pub mod models;
pub mod sqlite;

pub use models::ContainerRecord;
pub use models::ContainerStatus;
pub use models::EventRecord;
pub use models::Exercise;
pub use models::Level;
pub use models::ProgressRecord;
pub use models::ProgressStatus;
pub use sqlite::SqliteDatabase;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A database error.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// A migration error.
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A uniqueness constraint was violated.
    #[error("unique constraint violated: {0}")]
    Conflict(String),
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// A database trait containing the catalog, registry, journal, and progress
/// operations.
///
/// The registry is the single source of truth for sandbox containers. All
/// reads by subdomain used for routing require `status = running`; stale
/// subdomains return `None`.
#[async_trait]
pub trait Database: Send + Sync {
    // -- catalog --

    /// Create a new exercise.
    ///
    /// The image tag is unique across the catalog; inserting a duplicate
    /// returns [`DatabaseError::Conflict`].
    async fn create_exercise(
        &self,
        id: Uuid,
        name: &str,
        version: &str,
        description: &str,
        level: Level,
        image_tag: &str,
        metadata: &serde_json::Value,
    ) -> Result<Exercise>;

    /// Get an exercise by id.
    async fn get_exercise(&self, id: Uuid) -> Result<Option<Exercise>>;

    /// List all exercises, newest first.
    async fn list_exercises(&self) -> Result<Vec<Exercise>>;

    /// Update the mutable fields of an exercise.
    ///
    /// The image tag is immutable after creation. Returns `false` when the
    /// exercise does not exist.
    async fn update_exercise(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool>;

    /// Delete an exercise.
    ///
    /// Returns `false` when the exercise does not exist.
    async fn delete_exercise(&self, id: Uuid) -> Result<bool>;

    // -- registry --

    /// Insert a running container record.
    ///
    /// The subdomain is allocated by the caller and unique across all
    /// non-purged records; the host port must already be known.
    async fn insert_container(
        &self,
        id: &str,
        exercise_id: Uuid,
        subject: &str,
        subdomain: Uuid,
        host_port: &str,
    ) -> Result<ContainerRecord>;

    /// Get a container record by id, any status.
    async fn get_container(&self, id: &str) -> Result<Option<ContainerRecord>>;

    /// Get a container record by subdomain, any status.
    async fn get_container_by_subdomain(
        &self,
        subdomain: Uuid,
    ) -> Result<Option<ContainerRecord>>;

    /// Get the running container record for a subdomain.
    ///
    /// Stale (non-running) subdomains return `None` so the router reports
    /// them as not found.
    async fn get_running_by_subdomain(
        &self,
        subdomain: Uuid,
    ) -> Result<Option<ContainerRecord>>;

    /// Get the running container for a (subject, exercise) pair.
    async fn get_running_by_subject_exercise(
        &self,
        subject: &str,
        exercise_id: Uuid,
    ) -> Result<Option<ContainerRecord>>;

    /// List a subject's running containers, newest first.
    async fn list_running_by_subject(&self, subject: &str) -> Result<Vec<ContainerRecord>>;

    /// List all running containers.
    async fn list_running(&self) -> Result<Vec<ContainerRecord>>;

    /// Count a subject's running containers.
    async fn count_running_by_subject(&self, subject: &str) -> Result<i64>;

    /// Transition a running container to `stopped`.
    ///
    /// The status is monotone: records already `stopped` or `completed` are
    /// left untouched. Returns `true` iff the record transitioned.
    async fn set_container_stopped(&self, id: &str) -> Result<bool>;

    /// Transition a running container to `completed`.
    ///
    /// Returns `true` iff the record transitioned.
    async fn set_container_completed(&self, id: &str) -> Result<bool>;

    /// Persist the last observed activity for a container.
    async fn touch_container_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Purge terminal records created more than `retention_secs` ago.
    ///
    /// Returns the number of purged records.
    async fn purge_terminal_older_than(&self, retention_secs: i64) -> Result<u64>;

    // -- journal --

    /// Append an event to the journal.
    async fn record_event(
        &self,
        kind: &str,
        subject: Option<&str>,
        target: Option<&str>,
        attributes: &serde_json::Value,
    ) -> Result<()>;

    /// List journal events, newest first.
    ///
    /// The page size is capped at 1000.
    async fn list_events(&self, limit: Option<i64>, offset: Option<i64>)
        -> Result<Vec<EventRecord>>;

    // -- progress --

    /// Record a launch attempt for a (subject, exercise) pair.
    ///
    /// Increments the attempt counter and marks the progress `in_progress`
    /// unless it is already `completed`.
    async fn record_progress_attempt(&self, subject: &str, exercise_id: Uuid) -> Result<()>;

    /// Mark a (subject, exercise) pair completed.
    async fn mark_progress_completed(
        &self,
        subject: &str,
        exercise_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// List a subject's progress entries.
    async fn list_progress_by_subject(&self, subject: &str) -> Result<Vec<ProgressRecord>>;
}
