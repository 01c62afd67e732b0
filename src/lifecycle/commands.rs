//! Lifecycle command and response types.

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::reconciler::ReconcileReport;
use super::svc::CompleteError;
use super::svc::LaunchError;
use super::svc::ReconcileError;
use super::svc::StopError;
use super::StopReason;
use crate::db::ContainerStatus;

/// Response to a successful launch.
#[derive(Debug, Clone)]
pub struct LaunchResponse {
    /// The runtime-assigned container id.
    pub container_id: String,
    /// The sandbox's allocated subdomain.
    pub subdomain: Uuid,
}

/// Response to a successful stop.
#[derive(Debug, Clone)]
pub struct StopResponse {
    /// The container id.
    pub container_id: String,
    /// The record's status after the stop.
    pub status: ContainerStatus,
}

/// Response to a successful completion report.
#[derive(Debug, Clone)]
pub struct CompleteResponse {
    /// The container id the subdomain resolved to.
    pub container_id: String,
}

/// The outcome of a reconcile request.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// Reconciliation ran to completion.
    Ran(ReconcileReport),
    /// A reconciliation was already in flight; this request was skipped.
    Skipped,
}

/// Commands sent to the lifecycle service.
#[derive(Debug)]
pub enum LifecycleCmd {
    /// Launch a sandbox for a (subject, exercise) pair.
    Launch {
        /// The authenticated subject.
        subject: String,
        /// The exercise to launch.
        exercise_id: Uuid,
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<LaunchResponse, LaunchError>>,
    },

    /// Stop and remove a sandbox container.
    Stop {
        /// The container id.
        container_id: String,
        /// Why the container is being stopped.
        reason: StopReason,
        /// When set, the stop is denied unless this subject owns the
        /// container.
        owner: Option<String>,
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<StopResponse, StopError>>,
    },

    /// Record an exercise completion reported from inside a sandbox.
    Complete {
        /// The sandbox subdomain.
        subdomain: Uuid,
        /// The completion payload, recorded verbatim in the journal.
        payload: Value,
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<CompleteResponse, CompleteError>>,
    },

    /// Reconcile the registry with the runtime; single-flight.
    Reconcile {
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<ReconcileOutcome, ReconcileError>>,
    },

    /// Shut down the service, cancelling all watchers.
    ///
    /// Running containers are left alone; they are recovered or reaped on
    /// the next boot.
    Shutdown {
        /// Channel acknowledged once the service has stopped.
        rx: oneshot::Sender<()>,
    },
}
