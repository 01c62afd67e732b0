//! Sandbox container lifecycle management.
//!
//! The lifecycle service is the only component that mutates container
//! status. It enforces the launch policy, drives the container state
//! machine, runs one watcher per running sandbox, and periodically
//! reconciles the registry with the runtime.

use std::fmt;

use serde::Serialize;

pub mod commands;
pub mod reconciler;
pub mod svc;
pub mod watcher;

pub use commands::LifecycleCmd;
pub use reconciler::ReconcileReport;
pub use svc::LifecycleSvc;

/// Why a sandbox container was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// The owning subject asked for the stop.
    User,
    /// An administrator forced the stop.
    Admin,
    /// The idle limit elapsed without activity.
    Idle,
    /// The absolute lifetime limit elapsed.
    Lifetime,
    /// Reconciliation found the record and runtime out of sync.
    Orphan,
    /// The orchestrator shut down.
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::User => write!(f, "user"),
            StopReason::Admin => write!(f, "admin"),
            StopReason::Idle => write!(f, "idle"),
            StopReason::Lifetime => write!(f, "lifetime"),
            StopReason::Orphan => write!(f, "orphan"),
            StopReason::Shutdown => write!(f, "shutdown"),
        }
    }
}
