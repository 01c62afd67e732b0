//! Per-container idle and lifetime watchers.

use std::time::Duration;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use super::LifecycleCmd;
use super::StopReason;
use crate::activity::ActivityTracker;
use crate::db::Database;

/// Parameters for a single container watcher.
#[derive(Debug, Clone)]
pub(crate) struct WatcherParams {
    /// The watched container id.
    pub container_id: String,
    /// The sandbox subdomain, the activity key.
    pub subdomain: Uuid,
    /// When the container was launched.
    pub created_at: DateTime<Utc>,
    /// Activity fallback when the tracker has no entry.
    pub last_activity: DateTime<Utc>,
    /// Tick interval.
    pub check_interval: Duration,
    /// Idle limit before reaping.
    pub idle_limit: Duration,
    /// Absolute lifetime limit before reaping.
    pub lifetime_limit: Duration,
}

/// Decides whether a container is due for reaping.
///
/// The idle check wins when both limits have elapsed.
pub(crate) fn reap_reason(
    now: DateTime<Utc>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    idle_limit: TimeDelta,
    lifetime_limit: TimeDelta,
) -> Option<StopReason> {
    if now.signed_duration_since(last_activity) >= idle_limit {
        Some(StopReason::Idle)
    } else if now.signed_duration_since(created_at) >= lifetime_limit {
        Some(StopReason::Lifetime)
    } else {
        None
    }
}

/// Spawns the watcher loop for one running container.
///
/// The loop ticks on `check_interval`, persists the last observed activity,
/// and requests a stop through the lifecycle service once the idle or
/// lifetime limit elapses. It terminates within one tick of its token being
/// cancelled.
pub(crate) fn spawn(
    params: WatcherParams,
    activity: ActivityTracker,
    db: Arc<dyn Database>,
    tx: mpsc::Sender<LifecycleCmd>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let idle_limit =
            TimeDelta::from_std(params.idle_limit).unwrap_or(TimeDelta::MAX);
        let lifetime_limit =
            TimeDelta::from_std(params.lifetime_limit).unwrap_or(TimeDelta::MAX);

        let mut interval = tokio::time::interval(params.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; checks start one interval in.
        interval.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(container = %params.container_id, "watcher cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let last = activity
                        .last_activity(params.subdomain)
                        .unwrap_or(params.last_activity);

                    if let Err(e) = db
                        .touch_container_activity(&params.container_id, last)
                        .await
                    {
                        warn!(
                            container = %params.container_id,
                            error = %e,
                            "failed to persist last activity"
                        );
                    }

                    let Some(reason) =
                        reap_reason(Utc::now(), params.created_at, last, idle_limit, lifetime_limit)
                    else {
                        continue;
                    };

                    debug!(container = %params.container_id, %reason, "watcher reaping container");

                    let (done_tx, done_rx) = oneshot::channel();
                    let cmd = LifecycleCmd::Stop {
                        container_id: params.container_id.clone(),
                        reason,
                        owner: None,
                        rx: done_tx,
                    };
                    if tx.send(cmd).await.is_err() {
                        break;
                    }
                    if let Ok(Err(e)) = done_rx.await {
                        warn!(
                            container = %params.container_id,
                            error = %e,
                            "reap request failed"
                        );
                    }
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 15-minute idle limit used by the tests.
    fn idle() -> TimeDelta {
        TimeDelta::minutes(15)
    }

    /// 2-hour lifetime limit used by the tests.
    fn lifetime() -> TimeDelta {
        TimeDelta::hours(2)
    }

    #[test]
    fn fresh_container_is_not_reaped() {
        let now = Utc::now();
        assert_eq!(reap_reason(now, now, now, idle(), lifetime()), None);
    }

    #[test]
    fn idle_limit_reaps() {
        let now = Utc::now();
        let created = now - TimeDelta::minutes(30);
        let last = now - TimeDelta::minutes(16);
        assert_eq!(
            reap_reason(now, created, last, idle(), lifetime()),
            Some(StopReason::Idle)
        );
    }

    #[test]
    fn activity_within_the_idle_window_defers_reaping() {
        let now = Utc::now();
        let created = now - TimeDelta::minutes(90);
        let last = now - TimeDelta::minutes(14);
        assert_eq!(reap_reason(now, created, last, idle(), lifetime()), None);
    }

    #[test]
    fn lifetime_limit_reaps_despite_recent_activity() {
        let now = Utc::now();
        let created = now - TimeDelta::hours(3);
        let last = now - TimeDelta::minutes(1);
        assert_eq!(
            reap_reason(now, created, last, idle(), lifetime()),
            Some(StopReason::Lifetime)
        );
    }

    #[test]
    fn limits_are_inclusive() {
        let now = Utc::now();
        assert_eq!(
            reap_reason(now, now - lifetime(), now, idle(), lifetime()),
            Some(StopReason::Lifetime)
        );
        assert_eq!(
            reap_reason(now, now, now - idle(), idle(), lifetime()),
            Some(StopReason::Idle)
        );
    }
}
