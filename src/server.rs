//! Server setup and routing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::activity::ActivityTracker;
use crate::builder::ImageBuilder;
use crate::config::Config;
use crate::db::Database;
use crate::db::SqliteDatabase;
use crate::events::Journal;
use crate::lifecycle::LifecycleCmd;
use crate::lifecycle::LifecycleSvc;
use crate::proxy;
use crate::proxy::ProxyState;
use crate::runtime::ContainerRuntime;
use crate::runtime::DockerRuntime;

pub mod api;
pub mod auth;

use api::admin::*;
use api::containers::*;
use api::exercises::*;
use api::AppState;

/// Channel buffer size for lifecycle commands.
const LIFECYCLE_CHANNEL_CAPACITY: usize = 1024;

/// Headroom on the raw body limit for multipart framing.
const UPLOAD_LIMIT_SLACK: usize = 64 * 1024;

/// Deadline for draining the lifecycle service at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    paths(
        upload_exercise,
        list_exercises,
        delete_exercise,
        launch_exercise,
        list_containers,
        stop_container,
        complete_container,
        admin_list_containers,
        admin_stop_container,
        admin_list_events,
    ),
    components(schemas(
        api::exercises::UploadResponse,
        api::exercises::ImageSummary,
        api::exercises::ListExercisesResponse,
        api::exercises::ExerciseSummary,
        api::exercises::DeleteExerciseResponse,
        api::exercises::LaunchExerciseResponse,
        api::containers::ListContainersResponse,
        api::containers::ContainerSummary,
        api::containers::StopContainerResponse,
        api::containers::CompleteResponse,
        api::admin::ListEventsResponse,
        api::admin::EventSummary,
        api::error::ErrorResponse,
        crate::db::Level,
        crate::db::ContainerStatus,
        crate::db::ProgressStatus,
    )),
    tags(
        (name = "exercises", description = "Exercise catalog endpoints"),
        (name = "containers", description = "Sandbox container endpoints"),
        (name = "admin", description = "Administrative endpoints")
    )
)]
struct ApiDoc;

/// Liveness probe.
async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let upload_limit = state.config.server.upload_max_size + UPLOAD_LIMIT_SLACK;

    let api = Router::new()
        .route(
            "/exercises/upload",
            post(upload_exercise).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/exercises", get(list_exercises))
        .route("/exercises/{id}", delete(delete_exercise))
        .route("/exercises/launch/{id}", post(launch_exercise))
        .route("/containers", get(list_containers))
        .route("/containers/{id}/stop", post(stop_container))
        .route("/containers/{id}/complete", post(complete_container))
        .route("/admin/containers", get(admin_list_containers))
        .route("/admin/containers/{id}/stop", post(admin_stop_container))
        .route("/admin/events", get(admin_list_events))
        .with_state(state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(CorsLayer::permissive())
}

/// Run the server.
///
/// # Errors
///
/// Returns an error if the registry database cannot be opened, the runtime
/// client cannot be configured, or the listening socket cannot be bound;
/// all of these are fatal.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let db: Arc<dyn Database> = Arc::new(
        SqliteDatabase::new(&config.database.path)
            .await
            .context("failed to open the registry database")?,
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect().context("failed to configure the container runtime")?,
    );

    run_with(config, db, runtime).await
}

/// Run the server on pre-built database and runtime handles.
pub async fn run_with(
    config: Arc<Config>,
    db: Arc<dyn Database>,
    runtime: Arc<dyn ContainerRuntime>,
) -> anyhow::Result<()> {
    let activity = ActivityTracker::new();
    let journal = Journal::new(db.clone());

    let (lifecycle_handle, lifecycle_tx) = LifecycleSvc::spawn(
        LIFECYCLE_CHANNEL_CAPACITY,
        config.clone(),
        db.clone(),
        runtime.clone(),
        activity.clone(),
        journal.clone(),
    );

    spawn_reconcile_timer(lifecycle_tx.clone(), config.lifecycle.reconcile_interval());

    let builder = Arc::new(ImageBuilder::new(
        runtime.clone(),
        db.clone(),
        journal.clone(),
    ));

    let state = AppState::builder()
        .config(config.clone())
        .db(db.clone())
        .runtime(runtime)
        .builder(builder)
        .lifecycle_tx(lifecycle_tx.clone())
        .activity(activity.clone())
        .journal(journal)
        .build();

    let proxy_state = ProxyState {
        db,
        activity,
        client: proxy::client(),
        timeout: config.proxy.timeout(),
    };

    let app = create_router(state)
        .layer(middleware::from_fn_with_state(proxy_state, proxy::layer))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind `{addr}`"))?;

    info!("server listening on `{addr}`");

    // The shutdown signal starts the drain clock: in-flight requests get
    // `SHUTDOWN_GRACE` to finish, then the server task is aborted.
    let (drain_tx, drain_rx) = oneshot::channel();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = drain_tx.send(());
        })
        .await
    });

    tokio::select! {
        result = &mut server => {
            result??;
        }
        _ = drain_rx => {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(result) => result??,
                Err(_) => {
                    warn!("drain deadline elapsed; aborting in-flight requests");
                    server.abort();
                }
            }
        }
    }

    // Cancel watchers; running sandboxes are intentionally left alive to
    // be recovered or reaped on the next boot.
    let (tx, rx) = oneshot::channel();
    if lifecycle_tx
        .send(LifecycleCmd::Shutdown { rx: tx })
        .await
        .is_ok()
    {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, rx).await;
    }
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, lifecycle_handle).await;

    Ok(())
}

/// Requests a reconciliation at boot and on every period thereafter.
fn spawn_reconcile_timer(tx: api::LifecycleTx, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let (done_tx, done_rx) = oneshot::channel();
            if tx
                .send(LifecycleCmd::Reconcile { rx: done_tx })
                .await
                .is_err()
            {
                break;
            }
            let _ = done_rx.await;
        }
    });
}

/// Resolves when the process receives a shutdown signal.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received; draining");
}
