//! The lifecycle service actor.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;
use uuid::Uuid;

use super::commands::CompleteResponse;
use super::commands::LaunchResponse;
use super::commands::LifecycleCmd;
use super::commands::ReconcileOutcome;
use super::commands::StopResponse;
use super::reconciler;
use super::reconciler::ReconcileReport;
use super::watcher;
use super::watcher::WatcherParams;
use super::StopReason;
use crate::activity::ActivityTracker;
use crate::config::Config;
use crate::db::ContainerRecord;
use crate::db::ContainerStatus;
use crate::db::Database;
use crate::db::DatabaseError;
use crate::events::EventKind;
use crate::events::Journal;
use crate::runtime::ContainerRuntime;
use crate::runtime::RuntimeError;
use crate::runtime::SandboxSpec;
use crate::runtime::ENV_CALLBACK_URL;
use crate::runtime::ENV_SUBDOMAIN;

/// Error type for launching a sandbox.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The exercise does not exist in the catalog.
    #[error("exercise not found: `{0}`")]
    UnknownExercise(Uuid),

    /// The subject already has a running sandbox for this exercise.
    #[error("a sandbox for this exercise is already running at `{subdomain}`")]
    AlreadyRunning {
        /// The existing sandbox's subdomain.
        subdomain: Uuid,
    },

    /// The subject reached the concurrent sandbox quota.
    #[error("concurrent sandbox limit reached ({limit})")]
    QuotaExceeded {
        /// The configured limit.
        limit: i64,
    },

    /// The container runtime cannot be reached.
    #[error("container runtime is unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The runtime refused to create or start the sandbox.
    #[error("the runtime refused to start the sandbox: {0}")]
    RuntimeRefused(String),

    /// Database error.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<RuntimeError> for LaunchError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(reason) => LaunchError::RuntimeUnavailable(reason),
            other => LaunchError::RuntimeRefused(other.to_string()),
        }
    }
}

/// Error type for stopping a sandbox.
#[derive(Debug, Error)]
pub enum StopError {
    /// No container record matches the id.
    #[error("container not found: `{0}`")]
    NotFound(String),

    /// The requesting subject does not own the container.
    #[error("container is owned by another subject")]
    Forbidden,

    /// Database error.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Error type for recording a completion.
#[derive(Debug, Error)]
pub enum CompleteError {
    /// No container record matches the subdomain.
    #[error("no sandbox found for subdomain `{0}`")]
    NotFound(Uuid),

    /// Database error.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Error type for reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Runtime error.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Database error.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// The lifecycle service.
///
/// An actor owning every container status mutation. Launch policy checks
/// and registry inserts are serialized by the command loop, so two
/// concurrent launches for the same (subject, exercise) resolve to exactly
/// one success; the registry's partial unique index backs this up at the
/// store level.
#[allow(missing_debug_implementations)]
pub struct LifecycleSvc {
    /// Orchestrator configuration.
    config: Arc<Config>,
    /// A handle to the database.
    db: Arc<dyn Database>,
    /// The container runtime.
    runtime: Arc<dyn ContainerRuntime>,
    /// The activity tracker consulted by watchers.
    activity: ActivityTracker,
    /// The event journal.
    journal: Journal,
    /// The receiver for commands.
    rx: mpsc::Receiver<LifecycleCmd>,
    /// A sender handed to watchers and the reconciler.
    tx: mpsc::Sender<LifecycleCmd>,
    /// Cancellation tokens for the per-container watchers.
    watchers: HashMap<String, CancellationToken>,
    /// Single-flight flag for reconciliation.
    reconciling: Arc<AtomicBool>,
}

impl LifecycleSvc {
    /// Spawns the lifecycle service and returns:
    ///
    /// - the join handle of the event loop, and
    /// - the sender channel
    pub fn spawn(
        channel_buffer_size: usize,
        config: Arc<Config>,
        db: Arc<dyn Database>,
        runtime: Arc<dyn ContainerRuntime>,
        activity: ActivityTracker,
        journal: Journal,
    ) -> (JoinHandle<()>, mpsc::Sender<LifecycleCmd>) {
        let (tx, rx) = mpsc::channel(channel_buffer_size);
        let svc = Self {
            config,
            db,
            runtime,
            activity,
            journal,
            rx,
            tx: tx.clone(),
            watchers: HashMap::new(),
            reconciling: Arc::new(AtomicBool::new(false)),
        };
        let handle = tokio::spawn(svc.run());
        (handle, tx)
    }

    /// Runs the event loop.
    pub async fn run(mut self) {
        info!("lifecycle service started");

        if let Err(e) = self.recover().await {
            error!(error = %e, "failed to recover running sandboxes from the registry");
        }

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                LifecycleCmd::Launch {
                    subject,
                    exercise_id,
                    rx,
                } => {
                    trace!(%subject, %exercise_id, "received `Launch` command");
                    let result = self.handle_launch(&subject, exercise_id).await;
                    let _ = rx.send(result);
                }
                LifecycleCmd::Stop {
                    container_id,
                    reason,
                    owner,
                    rx,
                } => {
                    trace!(%container_id, %reason, "received `Stop` command");
                    let result = self.handle_stop(&container_id, reason, owner.as_deref()).await;
                    let _ = rx.send(result);
                }
                LifecycleCmd::Complete {
                    subdomain,
                    payload,
                    rx,
                } => {
                    trace!(%subdomain, "received `Complete` command");
                    let result = self.handle_complete(subdomain, payload).await;
                    // Callback failures other than an unknown subdomain are
                    // logged here; the caller still gets a 500.
                    if let Err(e) = &result {
                        if !matches!(e, CompleteError::NotFound(_)) {
                            warn!(%subdomain, error = %e, "completion report failed");
                        }
                    }
                    let _ = rx.send(result);
                }
                LifecycleCmd::Reconcile { rx } => {
                    trace!("received `Reconcile` command");
                    self.handle_reconcile(rx);
                }
                LifecycleCmd::Shutdown { rx } => {
                    trace!("received `Shutdown` command");
                    info!("lifecycle service is shutting down");
                    // Watchers are cancelled; running sandboxes are left to
                    // be recovered or reaped on the next boot.
                    for token in self.watchers.values() {
                        token.cancel();
                    }
                    let _ = rx.send(());
                    break;
                }
            }
        }

        info!("lifecycle service stopped");
    }

    /// Rebuilds in-memory state from the registry after a restart.
    async fn recover(&mut self) -> Result<(), DatabaseError> {
        let records = self.db.list_running().await?;
        let count = records.len();

        for record in records {
            self.activity.touch_at(record.subdomain, record.last_activity);
            self.spawn_watcher(&record);
        }

        if count > 0 {
            info!(count, "recovered running sandboxes from the registry");
        }

        Ok(())
    }

    /// Starts the idle/lifetime watcher for a running container.
    fn spawn_watcher(&mut self, record: &ContainerRecord) {
        let lifecycle = &self.config.lifecycle;
        let token = CancellationToken::new();
        let params = WatcherParams {
            container_id: record.id.clone(),
            subdomain: record.subdomain,
            created_at: record.created_at,
            last_activity: record.last_activity,
            check_interval: lifecycle.check_interval(),
            idle_limit: lifecycle.idle_limit(),
            lifetime_limit: lifecycle.lifetime_limit(),
        };

        watcher::spawn(
            params,
            self.activity.clone(),
            self.db.clone(),
            self.tx.clone(),
            token.clone(),
        );
        self.watchers.insert(record.id.clone(), token);
    }

    /// Stops and removes a runtime container after a failed launch step.
    async fn roll_back_launch(&self, container_id: &str) {
        if let Err(e) = self.runtime.stop_and_remove(container_id).await {
            warn!(
                container = %container_id,
                error = %e,
                "failed to roll back container after launch failure"
            );
        }
    }

    /// Handles a launch request.
    async fn handle_launch(
        &mut self,
        subject: &str,
        exercise_id: Uuid,
    ) -> Result<LaunchResponse, LaunchError> {
        if let Some(existing) = self
            .db
            .get_running_by_subject_exercise(subject, exercise_id)
            .await?
        {
            return Err(LaunchError::AlreadyRunning {
                subdomain: existing.subdomain,
            });
        }

        let limit = self.config.lifecycle.max_per_user;
        if self.db.count_running_by_subject(subject).await? >= limit {
            return Err(LaunchError::QuotaExceeded { limit });
        }

        self.runtime
            .ensure_network(&self.config.runtime.network)
            .await?;

        let subdomain = Uuid::new_v4();
        let name = format!("training-{subdomain}");

        let exercise = self
            .db
            .get_exercise(exercise_id)
            .await?
            .ok_or(LaunchError::UnknownExercise(exercise_id))?;

        let callback_url = format!(
            "{}/api/containers/{}/complete",
            self.config.public_url(),
            subdomain
        );
        let spec = SandboxSpec {
            image: exercise.image_tag.clone(),
            name,
            subdomain,
            subject: subject.to_string(),
            exercise_id,
            env: vec![
                (ENV_SUBDOMAIN.to_string(), subdomain.to_string()),
                (ENV_CALLBACK_URL.to_string(), callback_url),
            ],
            network: self.config.runtime.network.clone(),
        };

        let container_id = self.runtime.create_and_start(&spec).await?;

        let host_port = match self.runtime.inspect_host_port(&container_id).await {
            Ok(Some(port)) => port,
            Ok(None) => {
                self.roll_back_launch(&container_id).await;
                return Err(LaunchError::RuntimeRefused(String::from(
                    "the runtime did not assign a host port",
                )));
            }
            Err(e) => {
                self.roll_back_launch(&container_id).await;
                return Err(e.into());
            }
        };

        let record = match self
            .db
            .insert_container(&container_id, exercise_id, subject, subdomain, &host_port)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                // The container is live but unrecorded; remove it before
                // surfacing the error.
                self.roll_back_launch(&container_id).await;
                return Err(e.into());
            }
        };

        self.activity.touch_at(subdomain, record.created_at);
        self.spawn_watcher(&record);

        info!(
            container = %container_id,
            %subject,
            exercise = %exercise_id,
            %subdomain,
            "sandbox launched"
        );
        self.journal
            .record(
                EventKind::ContainerCreated,
                Some(subject),
                Some(&container_id),
                json!({
                    "subdomain": subdomain,
                    "exercise_id": exercise_id,
                    "image": exercise.image_tag,
                }),
            )
            .await;

        if let Err(e) = self.db.record_progress_attempt(subject, exercise_id).await {
            warn!(%subject, exercise = %exercise_id, error = %e, "failed to record launch attempt");
        }

        Ok(LaunchResponse {
            container_id,
            subdomain,
        })
    }

    /// Handles a stop request.
    async fn handle_stop(
        &mut self,
        container_id: &str,
        reason: StopReason,
        owner: Option<&str>,
    ) -> Result<StopResponse, StopError> {
        let record = self
            .db
            .get_container(container_id)
            .await?
            .ok_or_else(|| StopError::NotFound(container_id.to_string()))?;

        if let Some(owner) = owner {
            if record.subject != owner {
                return Err(StopError::Forbidden);
            }
        }

        // Best-effort: the runtime container may already be gone.
        if let Err(e) = self.runtime.stop_and_remove(&record.id).await {
            warn!(container = %record.id, error = %e, "failed to stop runtime container");
        }

        // Monotone status: a completed record stays completed even though
        // its runtime container is removed.
        let transitioned = self.db.set_container_stopped(&record.id).await?;
        let status = if transitioned {
            ContainerStatus::Stopped
        } else {
            record.status
        };

        self.activity.evict(record.subdomain);
        if let Some(token) = self.watchers.remove(&record.id) {
            token.cancel();
        }

        if transitioned || record.status == ContainerStatus::Completed {
            info!(container = %record.id, %reason, "sandbox stopped");
            self.journal
                .record(
                    EventKind::ContainerStopped,
                    Some(&record.subject),
                    Some(&record.id),
                    json!({ "reason": reason, "subdomain": record.subdomain }),
                )
                .await;
        }

        Ok(StopResponse {
            container_id: record.id,
            status,
        })
    }

    /// Handles a completion report from inside a sandbox.
    ///
    /// The sandbox is not stopped here; its watcher reaps it later unless
    /// the subject stops it explicitly. Repeated reports settle on the same
    /// terminal state.
    async fn handle_complete(
        &mut self,
        subdomain: Uuid,
        payload: serde_json::Value,
    ) -> Result<CompleteResponse, CompleteError> {
        let record = self
            .db
            .get_container_by_subdomain(subdomain)
            .await?
            .ok_or(CompleteError::NotFound(subdomain))?;

        self.db
            .mark_progress_completed(&record.subject, record.exercise_id, Utc::now())
            .await?;

        let transitioned = self.db.set_container_completed(&record.id).await?;
        if transitioned {
            info!(container = %record.id, subject = %record.subject, "exercise completed");
        }

        self.journal
            .record(
                EventKind::ExerciseCompleted,
                Some(&record.subject),
                Some(&record.id),
                payload,
            )
            .await;

        Ok(CompleteResponse {
            container_id: record.id,
        })
    }

    /// Handles a reconcile request; re-entry is skipped, not queued.
    fn handle_reconcile(
        &self,
        rx: oneshot::Sender<Result<ReconcileOutcome, ReconcileError>>,
    ) {
        if self.reconciling.swap(true, Ordering::SeqCst) {
            let _ = rx.send(Ok(ReconcileOutcome::Skipped));
            return;
        }

        let runtime = self.runtime.clone();
        let db = self.db.clone();
        let tx = self.tx.clone();
        let journal = self.journal.clone();
        let retention_secs = self.config.lifecycle.stopped_retention_secs as i64;
        let reconciling = self.reconciling.clone();

        tokio::spawn(async move {
            let result: Result<ReconcileReport, ReconcileError> =
                reconciler::reconcile(runtime, db, tx, journal, retention_secs).await;
            reconciling.store(false, Ordering::SeqCst);

            if let Err(e) = &result {
                error!(error = %e, "reconciliation failed");
            }

            let _ = rx.send(result.map(ReconcileOutcome::Ran));
        });
    }
}
