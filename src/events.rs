//! The orchestration event journal.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::db::Database;

/// The kinds of events recorded in the journal.
///
/// `user.*` kinds are part of the shared audit vocabulary and are emitted by
/// the identity layer fronting this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A user logged in.
    UserLogin,
    /// A user logged out.
    UserLogout,
    /// A registration attempt failed.
    UserRegisterFailed,
    /// An exercise image was built and cataloged.
    ImageBuilt,
    /// An exercise image was deleted.
    ImageDeleted,
    /// A sandbox container was created and started.
    ContainerCreated,
    /// A sandbox container was stopped and removed.
    ContainerStopped,
    /// An exercise reported completion.
    ExerciseCompleted,
}

impl EventKind {
    /// The journal string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserLogin => "user.login",
            EventKind::UserLogout => "user.logout",
            EventKind::UserRegisterFailed => "user.register.failed",
            EventKind::ImageBuilt => "image.built",
            EventKind::ImageDeleted => "image.deleted",
            EventKind::ContainerCreated => "container.created",
            EventKind::ContainerStopped => "container.stopped",
            EventKind::ExerciseCompleted => "exercise.completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only writer for the orchestration event journal.
///
/// Journal writes never block or fail the paths that emit them: failures
/// are logged and swallowed.
#[derive(Clone)]
pub struct Journal {
    /// Database handle backing the journal.
    db: Arc<dyn Database>,
}

impl Journal {
    /// Create a journal writer.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Append an event.
    pub async fn record(
        &self,
        kind: EventKind,
        subject: Option<&str>,
        target: Option<&str>,
        attributes: serde_json::Value,
    ) {
        if let Err(e) = self
            .db
            .record_event(kind.as_str(), subject, target, &attributes)
            .await
        {
            warn!(kind = %kind, error = %e, "failed to record journal event");
        }
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal").finish_non_exhaustive()
    }
}
