//! API state, routes, and handlers.

use std::sync::Arc;

use bon::Builder;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::activity::ActivityTracker;
use crate::builder::ImageBuilder;
use crate::config::Config;
use crate::db::Database;
use crate::events::Journal;
use crate::lifecycle::LifecycleCmd;
use crate::runtime::ContainerRuntime;

pub mod admin;
pub mod containers;
pub mod error;
pub mod exercises;

use error::Error;

/// A sender for lifecycle commands.
pub type LifecycleTx = mpsc::Sender<LifecycleCmd>;

/// Application state.
#[derive(Builder, Clone)]
pub struct AppState {
    /// Orchestrator configuration.
    pub config: Arc<Config>,
    /// Database handle.
    pub db: Arc<dyn Database>,
    /// Container runtime handle.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Image builder.
    pub builder: Arc<ImageBuilder>,
    /// Lifecycle command transmitter.
    pub lifecycle_tx: LifecycleTx,
    /// Activity tracker.
    pub activity: ActivityTracker,
    /// Event journal.
    pub journal: Journal,
}

/// Sends a command to the lifecycle service and awaits its reply.
pub(crate) async fn send_command<T, E, F>(tx: &LifecycleTx, build: F) -> Result<T, Error>
where
    F: FnOnce(oneshot::Sender<Result<T, E>>) -> LifecycleCmd,
    Error: From<E>,
{
    let (reply_tx, reply_rx) = oneshot::channel();

    tx.send(build(reply_tx))
        .await
        .map_err(|_| Error::Internal)?;

    reply_rx
        .await
        .map_err(|_| Error::Internal)?
        .map_err(Error::from)
}
