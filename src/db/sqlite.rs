//! SQLite database implementation.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqliteSynchronous;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::ContainerRecord;
use super::models::EventRecord;
use super::models::Exercise;
use super::models::Level;
use super::models::ProgressRecord;
use super::Database;
use super::DatabaseError;
use super::Result;

/// Default page size for pagination.
const DEFAULT_PAGE_SIZE: i64 = 100;

/// Hard cap on journal page size.
const MAX_EVENT_PAGE_SIZE: i64 = 1000;

/// SQLite connection string prefix.
const SQLITE_CONNECTION_PREFIX: &str = "sqlite:";

/// Configure 5-second timeout when the database is locked to prevent
/// spurious failures.
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// Enable foreign key constraint enforcement for referential integrity.
const SQLITE_FOREIGN_KEYS: &str = "on";

/// Column list for exercise queries.
const EXERCISE_COLUMNS: &str =
    "id, name, version, description, level, image_tag, metadata, created_at, updated_at";

/// Column list for container queries.
const CONTAINER_COLUMNS: &str =
    "id, exercise_id, subject, subdomain, status, host_port, created_at, last_activity";

/// SQLite database implementation.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    /// The underlying SQLite connection pool.
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection from a path.
    ///
    /// Migrations are run upon a successful connection pool being
    /// established. WAL journaling is enabled so journal writers never block
    /// readers.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let database_url = format!("{}//{}", SQLITE_CONNECTION_PREFIX, path.display());
        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT)
            .pragma("foreign_keys", SQLITE_FOREIGN_KEYS);

        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Creates a new SQLite connection from an existing pool.
    ///
    /// This method also runs the embedded migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Maps unique constraint violations to [`DatabaseError::Conflict`].
fn map_insert_error(err: sqlx::Error, what: &str) -> DatabaseError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DatabaseError::Conflict(what.to_string())
        }
        _ => DatabaseError::Sqlx(err),
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn create_exercise(
        &self,
        id: Uuid,
        name: &str,
        version: &str,
        description: &str,
        level: Level,
        image_tag: &str,
        metadata: &serde_json::Value,
    ) -> Result<Exercise> {
        sqlx::query(
            "insert into exercises (id, name, version, description, level, image_tag, metadata) \
             values (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(version)
        .bind(description)
        .bind(level)
        .bind(image_tag)
        .bind(metadata.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, image_tag))?;

        let exercise: Exercise = sqlx::query_as(&format!(
            "select {EXERCISE_COLUMNS} from exercises where id = ?"
        ))
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(exercise)
    }

    async fn get_exercise(&self, id: Uuid) -> Result<Option<Exercise>> {
        let exercise: Option<Exercise> = sqlx::query_as(&format!(
            "select {EXERCISE_COLUMNS} from exercises where id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(exercise)
    }

    async fn list_exercises(&self) -> Result<Vec<Exercise>> {
        let exercises: Vec<Exercise> = sqlx::query_as(&format!(
            "select {EXERCISE_COLUMNS} from exercises order by created_at desc"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(exercises)
    }

    async fn update_exercise(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "update exercises set \
             name = coalesce(?, name), \
             description = coalesce(?, description), \
             metadata = coalesce(?, metadata), \
             updated_at = current_timestamp \
             where id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(metadata.map(|m| m.to_string()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_exercise(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("delete from exercises where id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_container(
        &self,
        id: &str,
        exercise_id: Uuid,
        subject: &str,
        subdomain: Uuid,
        host_port: &str,
    ) -> Result<ContainerRecord> {
        sqlx::query(
            "insert into containers (id, exercise_id, subject, subdomain, status, host_port) \
             values (?, ?, ?, ?, 'running', ?)",
        )
        .bind(id)
        .bind(exercise_id.to_string())
        .bind(subject)
        .bind(subdomain.to_string())
        .bind(host_port)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, id))?;

        let record: ContainerRecord = sqlx::query_as(&format!(
            "select {CONTAINER_COLUMNS} from containers where id = ?"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerRecord>> {
        let record: Option<ContainerRecord> = sqlx::query_as(&format!(
            "select {CONTAINER_COLUMNS} from containers where id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_container_by_subdomain(
        &self,
        subdomain: Uuid,
    ) -> Result<Option<ContainerRecord>> {
        let record: Option<ContainerRecord> = sqlx::query_as(&format!(
            "select {CONTAINER_COLUMNS} from containers where subdomain = ?"
        ))
        .bind(subdomain.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_running_by_subdomain(
        &self,
        subdomain: Uuid,
    ) -> Result<Option<ContainerRecord>> {
        let record: Option<ContainerRecord> = sqlx::query_as(&format!(
            "select {CONTAINER_COLUMNS} from containers \
             where subdomain = ? and status = 'running'"
        ))
        .bind(subdomain.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_running_by_subject_exercise(
        &self,
        subject: &str,
        exercise_id: Uuid,
    ) -> Result<Option<ContainerRecord>> {
        let record: Option<ContainerRecord> = sqlx::query_as(&format!(
            "select {CONTAINER_COLUMNS} from containers \
             where subject = ? and exercise_id = ? and status = 'running'"
        ))
        .bind(subject)
        .bind(exercise_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_running_by_subject(&self, subject: &str) -> Result<Vec<ContainerRecord>> {
        let records: Vec<ContainerRecord> = sqlx::query_as(&format!(
            "select {CONTAINER_COLUMNS} from containers \
             where subject = ? and status = 'running' order by created_at desc"
        ))
        .bind(subject)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_running(&self) -> Result<Vec<ContainerRecord>> {
        let records: Vec<ContainerRecord> = sqlx::query_as(&format!(
            "select {CONTAINER_COLUMNS} from containers \
             where status = 'running' order by created_at desc"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn count_running_by_subject(&self, subject: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "select count(*) from containers where subject = ? and status = 'running'",
        )
        .bind(subject)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn set_container_stopped(&self, id: &str) -> Result<bool> {
        let result =
            sqlx::query("update containers set status = 'stopped' where id = ? and status = 'running'")
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_container_completed(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "update containers set status = 'completed' where id = ? and status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch_container_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("update containers set last_activity = ? where id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn purge_terminal_older_than(&self, retention_secs: i64) -> Result<u64> {
        let result = sqlx::query(
            "delete from containers \
             where status != 'running' \
             and created_at < datetime('now', '-' || ? || ' seconds')",
        )
        .bind(retention_secs)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn record_event(
        &self,
        kind: &str,
        subject: Option<&str>,
        target: Option<&str>,
        attributes: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query("insert into events (kind, subject, target, attributes) values (?, ?, ?, ?)")
            .bind(kind)
            .bind(subject)
            .bind(target)
            .bind(attributes.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_events(
        &self,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let limit = limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(0, MAX_EVENT_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);

        let events: Vec<EventRecord> = sqlx::query_as(
            "select id, kind, subject, target, attributes, created_at from events \
             order by id desc limit ? offset ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn record_progress_attempt(&self, subject: &str, exercise_id: Uuid) -> Result<()> {
        sqlx::query(
            "insert into progress (subject, exercise_id, status, attempts) \
             values (?, ?, 'in_progress', 1) \
             on conflict (subject, exercise_id) do update \
             set attempts = progress.attempts + 1, status = 'in_progress'",
        )
        .bind(subject)
        .bind(exercise_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_progress_completed(
        &self,
        subject: &str,
        exercise_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "insert into progress (subject, exercise_id, status, attempts, completed_at) \
             values (?, ?, 'completed', 0, ?) \
             on conflict (subject, exercise_id) do update \
             set status = 'completed', completed_at = excluded.completed_at",
        )
        .bind(subject)
        .bind(exercise_id.to_string())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_progress_by_subject(&self, subject: &str) -> Result<Vec<ProgressRecord>> {
        let records: Vec<ProgressRecord> = sqlx::query_as(
            "select subject, exercise_id, status, attempts, completed_at from progress \
             where subject = ?",
        )
        .bind(subject)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::ContainerStatus;
    use super::super::ProgressStatus;
    use super::*;

    /// Inserts a catalog exercise for container tests.
    async fn seed_exercise(db: &SqliteDatabase) -> Uuid {
        let id = Uuid::new_v4();
        db.create_exercise(
            id,
            "SQL Injection 101",
            "latest",
            "Find the flaw",
            Level::Beginner,
            &format!("training/sql-injection-101:{}", id),
            &json!({"title": "SQL Injection 101"}),
        )
        .await
        .expect("failed to create exercise");
        id
    }

    #[sqlx::test]
    async fn create_and_get_exercise(pool: SqlitePool) {
        let db = SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database");

        let id = Uuid::new_v4();
        let metadata = json!({"title": "XSS Lab", "goals": [{"id": 1}]});
        let exercise = db
            .create_exercise(
                id,
                "XSS Lab",
                "1.2",
                "Reflected XSS practice",
                Level::Intermediate,
                "training/xss-lab:1.2",
                &metadata,
            )
            .await
            .expect("failed to create exercise");

        assert_eq!(exercise.id, id);
        assert_eq!(exercise.name, "XSS Lab");
        assert_eq!(exercise.version, "1.2");
        assert_eq!(exercise.level, Level::Intermediate);
        assert_eq!(exercise.image_tag, "training/xss-lab:1.2");

        // Unknown metadata keys are preserved verbatim.
        let stored: serde_json::Value = serde_json::from_str(&exercise.metadata).unwrap();
        assert_eq!(stored, metadata);

        let retrieved = db
            .get_exercise(id)
            .await
            .expect("failed to get exercise")
            .expect("exercise not found");
        assert_eq!(retrieved.image_tag, exercise.image_tag);
    }

    #[sqlx::test]
    async fn duplicate_image_tag_conflicts(pool: SqlitePool) {
        let db = SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database");

        db.create_exercise(
            Uuid::new_v4(),
            "Lab",
            "latest",
            "d",
            Level::Beginner,
            "training/lab:latest",
            &json!({}),
        )
        .await
        .expect("first insert should succeed");

        let result = db
            .create_exercise(
                Uuid::new_v4(),
                "Lab",
                "latest",
                "d",
                Level::Beginner,
                "training/lab:latest",
                &json!({}),
            )
            .await;

        assert!(matches!(result, Err(DatabaseError::Conflict(_))));
    }

    #[sqlx::test]
    async fn update_and_delete_exercise(pool: SqlitePool) {
        let db = SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database");

        let id = seed_exercise(&db).await;

        let updated = db
            .update_exercise(id, Some("Renamed"), None, None)
            .await
            .expect("failed to update exercise");
        assert!(updated);

        let exercise = db.get_exercise(id).await.unwrap().unwrap();
        assert_eq!(exercise.name, "Renamed");
        // Untouched fields survive.
        assert_eq!(exercise.description, "Find the flaw");

        assert!(db.delete_exercise(id).await.unwrap());
        assert!(db.get_exercise(id).await.unwrap().is_none());
        assert!(!db.delete_exercise(id).await.unwrap());
    }

    #[sqlx::test]
    async fn insert_and_lookup_container(pool: SqlitePool) {
        let db = SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database");

        let exercise_id = seed_exercise(&db).await;
        let subdomain = Uuid::new_v4();

        let record = db
            .insert_container("abc123", exercise_id, "user-1", subdomain, "32768")
            .await
            .expect("failed to insert container");

        assert_eq!(record.id, "abc123");
        assert_eq!(record.status, ContainerStatus::Running);
        assert_eq!(record.host_port.as_deref(), Some("32768"));
        assert_eq!(record.subdomain, subdomain);

        let by_subdomain = db
            .get_running_by_subdomain(subdomain)
            .await
            .unwrap()
            .expect("running lookup should find the record");
        assert_eq!(by_subdomain.id, "abc123");

        assert_eq!(db.count_running_by_subject("user-1").await.unwrap(), 1);
        assert_eq!(db.list_running_by_subject("user-1").await.unwrap().len(), 1);
        assert!(db
            .get_running_by_subject_exercise("user-1", exercise_id)
            .await
            .unwrap()
            .is_some());
    }

    #[sqlx::test]
    async fn duplicate_subdomain_conflicts(pool: SqlitePool) {
        let db = SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database");

        let exercise_id = seed_exercise(&db).await;
        let subdomain = Uuid::new_v4();

        db.insert_container("c1", exercise_id, "user-1", subdomain, "32768")
            .await
            .expect("first insert should succeed");

        let other_exercise = seed_exercise(&db).await;
        let result = db
            .insert_container("c2", other_exercise, "user-2", subdomain, "32769")
            .await;

        assert!(matches!(result, Err(DatabaseError::Conflict(_))));
    }

    #[sqlx::test]
    async fn one_running_container_per_subject_exercise(pool: SqlitePool) {
        let db = SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database");

        let exercise_id = seed_exercise(&db).await;

        db.insert_container("c1", exercise_id, "user-1", Uuid::new_v4(), "32768")
            .await
            .expect("first insert should succeed");

        // A second running record for the same (subject, exercise) violates
        // the partial unique index.
        let result = db
            .insert_container("c2", exercise_id, "user-1", Uuid::new_v4(), "32769")
            .await;
        assert!(matches!(result, Err(DatabaseError::Conflict(_))));

        // Once the first is stopped, a new launch is allowed again.
        assert!(db.set_container_stopped("c1").await.unwrap());
        db.insert_container("c3", exercise_id, "user-1", Uuid::new_v4(), "32770")
            .await
            .expect("insert after stop should succeed");
    }

    #[sqlx::test]
    async fn status_is_monotone(pool: SqlitePool) {
        let db = SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database");

        let exercise_id = seed_exercise(&db).await;
        let subdomain = Uuid::new_v4();
        db.insert_container("c1", exercise_id, "user-1", subdomain, "32768")
            .await
            .unwrap();

        assert!(db.set_container_completed("c1").await.unwrap());

        // A later stop must not demote a completed record.
        assert!(!db.set_container_stopped("c1").await.unwrap());
        let record = db.get_container("c1").await.unwrap().unwrap();
        assert_eq!(record.status, ContainerStatus::Completed);

        // Stale subdomains are invisible to running lookups.
        assert!(db.get_running_by_subdomain(subdomain).await.unwrap().is_none());
        // But still resolvable for the completion path.
        assert!(db
            .get_container_by_subdomain(subdomain)
            .await
            .unwrap()
            .is_some());
    }

    #[sqlx::test]
    async fn purge_removes_only_old_terminal_records(pool: SqlitePool) {
        let db = SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database");

        let exercise_id = seed_exercise(&db).await;
        db.insert_container("old-stopped", exercise_id, "u", Uuid::new_v4(), "1")
            .await
            .unwrap();
        db.set_container_stopped("old-stopped").await.unwrap();
        db.insert_container("old-running", exercise_id, "v", Uuid::new_v4(), "2")
            .await
            .unwrap();
        db.insert_container("new-stopped", exercise_id, "w", Uuid::new_v4(), "3")
            .await
            .unwrap();
        db.set_container_stopped("new-stopped").await.unwrap();

        // Backdate two records past the retention window.
        sqlx::query(
            "update containers set created_at = datetime('now', '-2 days') \
             where id in ('old-stopped', 'old-running')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let purged = db.purge_terminal_older_than(24 * 60 * 60).await.unwrap();
        assert_eq!(purged, 1);

        // Old running records and recent terminal records survive.
        assert!(db.get_container("old-stopped").await.unwrap().is_none());
        assert!(db.get_container("old-running").await.unwrap().is_some());
        assert!(db.get_container("new-stopped").await.unwrap().is_some());
    }

    #[sqlx::test]
    async fn events_page_newest_first(pool: SqlitePool) {
        let db = SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database");

        for i in 0..3 {
            db.record_event("container.created", Some("user-1"), None, &json!({"n": i}))
                .await
                .unwrap();
        }

        let events = db.list_events(None, None).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[0].id > events[1].id);

        let page = db.list_events(Some(2), Some(1)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, events[1].id);
    }

    #[sqlx::test]
    async fn progress_attempts_and_completion(pool: SqlitePool) {
        let db = SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database");

        let exercise_id = seed_exercise(&db).await;

        db.record_progress_attempt("user-1", exercise_id).await.unwrap();
        db.record_progress_attempt("user-1", exercise_id).await.unwrap();

        let progress = db.list_progress_by_subject("user-1").await.unwrap();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].attempts, 2);
        assert_eq!(progress[0].status, ProgressStatus::InProgress);
        assert!(progress[0].completed_at.is_none());

        db.mark_progress_completed("user-1", exercise_id, Utc::now())
            .await
            .unwrap();

        let progress = db.list_progress_by_subject("user-1").await.unwrap();
        assert_eq!(progress[0].status, ProgressStatus::Completed);
        assert_eq!(progress[0].attempts, 2);
        assert!(progress[0].completed_at.is_some());

        // Completion is idempotent.
        db.mark_progress_completed("user-1", exercise_id, Utc::now())
            .await
            .unwrap();
        let progress = db.list_progress_by_subject("user-1").await.unwrap();
        assert_eq!(progress[0].status, ProgressStatus::Completed);
    }
}
