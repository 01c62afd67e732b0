//! Registry–runtime reconciliation.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::info;
use tracing::warn;

use super::svc::ReconcileError;
use super::LifecycleCmd;
use super::StopReason;
use crate::db::Database;
use crate::events::EventKind;
use crate::events::Journal;
use crate::runtime::ContainerRuntime;
use crate::runtime::LABEL_SUBJECT;

/// Counters from one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Runtime containers removed because no registry record matched.
    pub orphans_removed: usize,
    /// Running records marked stopped because their runtime container was
    /// missing.
    pub records_repaired: usize,
    /// Terminal records purged past the retention window.
    pub records_purged: u64,
}

/// Aligns the registry with the runtime and purges old terminal records.
///
/// Repairs to registry records are routed through the lifecycle service so
/// that status mutation and watcher cancellation stay in one place; runtime
/// orphans (no record at all) are removed directly.
pub(crate) async fn reconcile(
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<dyn Database>,
    tx: mpsc::Sender<LifecycleCmd>,
    journal: Journal,
    retention_secs: i64,
) -> Result<ReconcileReport, ReconcileError> {
    let mut report = ReconcileReport::default();

    let runtime_containers = runtime.list_managed(true).await?;
    let records = db.list_running().await?;

    let known: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();

    for container in &runtime_containers {
        if known.contains(container.id.as_str()) {
            continue;
        }

        match runtime.stop_and_remove(&container.id).await {
            Ok(()) => {
                report.orphans_removed += 1;
                journal
                    .record(
                        EventKind::ContainerStopped,
                        container.labels.get(LABEL_SUBJECT).map(String::as_str),
                        Some(&container.id),
                        json!({ "reason": StopReason::Orphan }),
                    )
                    .await;
            }
            Err(e) => {
                warn!(container = %container.id, error = %e, "failed to remove orphan container");
            }
        }
    }

    let live: HashSet<&str> = runtime_containers
        .iter()
        .filter(|c| c.running)
        .map(|c| c.id.as_str())
        .collect();

    for record in &records {
        if live.contains(record.id.as_str()) {
            continue;
        }

        let (done_tx, done_rx) = oneshot::channel();
        let cmd = LifecycleCmd::Stop {
            container_id: record.id.clone(),
            reason: StopReason::Orphan,
            owner: None,
            rx: done_tx,
        };
        if tx.send(cmd).await.is_err() {
            warn!("lifecycle service is gone; aborting reconciliation");
            return Ok(report);
        }
        match done_rx.await {
            Ok(Ok(_)) => report.records_repaired += 1,
            Ok(Err(e)) => {
                warn!(container = %record.id, error = %e, "failed to repair registry record");
            }
            Err(_) => {
                warn!(container = %record.id, "repair response channel closed");
            }
        }
    }

    report.records_purged = db.purge_terminal_older_than(retention_secs).await?;

    if let Err(e) = runtime.prune().await {
        warn!(error = %e, "runtime prune failed");
    }

    info!(
        orphans_removed = report.orphans_removed,
        records_repaired = report.records_repaired,
        records_purged = report.records_purged,
        "reconciliation finished"
    );

    Ok(report)
}
