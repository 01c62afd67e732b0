//! Shared support for integration tests.

#![allow(dead_code)]
#![allow(clippy::missing_docs_in_private_items)]

use std::collections::HashMap;
use std::io::Cursor;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::http::Response;
use axum::middleware;
use bytes::Bytes;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use uuid::Uuid;

use sandcastle::activity::ActivityTracker;
use sandcastle::builder::ImageBuilder;
use sandcastle::config::Config;
use sandcastle::db::Database;
use sandcastle::db::Exercise;
use sandcastle::db::Level;
use sandcastle::db::SqliteDatabase;
use sandcastle::events::Journal;
use sandcastle::lifecycle::commands::CompleteResponse;
use sandcastle::lifecycle::commands::LaunchResponse;
use sandcastle::lifecycle::commands::ReconcileOutcome;
use sandcastle::lifecycle::commands::StopResponse;
use sandcastle::lifecycle::svc::CompleteError;
use sandcastle::lifecycle::svc::LaunchError;
use sandcastle::lifecycle::svc::ReconcileError;
use sandcastle::lifecycle::svc::StopError;
use sandcastle::lifecycle::LifecycleCmd;
use sandcastle::lifecycle::LifecycleSvc;
use sandcastle::lifecycle::StopReason;
use sandcastle::proxy;
use sandcastle::proxy::ProxyState;
use sandcastle::runtime::ContainerRuntime;
use sandcastle::runtime::RuntimeContainer;
use sandcastle::runtime::RuntimeError;
use sandcastle::runtime::SandboxSpec;
use sandcastle::server::api::AppState;
use sandcastle::server::auth::ROLE_HEADER;
use sandcastle::server::auth::SUBJECT_HEADER;
use sandcastle::server::create_router;

/// Base domain used by the test configuration.
pub const BASE_DOMAIN: &str = "training.test";

/// A container held by the mock runtime.
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<(String, String)>,
    pub host_port: String,
    pub running: bool,
}

/// An in-memory stand-in for the container runtime.
#[derive(Debug, Default)]
pub struct MockRuntime {
    next: AtomicU64,
    pub containers: Mutex<HashMap<String, MockContainer>>,
    pub built: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub removed_images: Mutex<Vec<String>>,
    pub networks: Mutex<Vec<String>>,
    /// When set, `build_image` fails with a build error record.
    pub fail_build: AtomicBool,
    /// When set, `inspect_host_port` reports no binding.
    pub withhold_port: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plants a runtime container with no registry record.
    pub fn add_orphan(&self, labels: HashMap<String, String>) -> String {
        let id = format!("orphan-{}", self.next.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            MockContainer {
                name: id.clone(),
                image: String::from("training/orphan:latest"),
                labels,
                env: vec![],
                host_port: String::from("39999"),
                running: true,
            },
        );
        id
    }

    /// Number of stop-and-remove calls observed so far.
    pub fn removed_count(&self) -> usize {
        self.removed.lock().len()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.networks.lock().push(name.to_string());
        Ok(())
    }

    async fn build_image(&self, tag: &str, _context: Bytes) -> Result<(), RuntimeError> {
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(RuntimeError::Build(String::from(
                "mock build failure: step 3/4 exited with code 1",
            )));
        }
        self.built.lock().push(tag.to_string());
        Ok(())
    }

    async fn create_and_start(&self, spec: &SandboxSpec) -> Result<String, RuntimeError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{n}");
        self.containers.lock().insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                image: spec.image.clone(),
                labels: spec.labels(),
                env: spec.env.clone(),
                host_port: format!("{}", 30_000 + n),
                running: true,
            },
        );
        Ok(id)
    }

    async fn inspect_host_port(&self, id: &str) -> Result<Option<String>, RuntimeError> {
        if self.withhold_port.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self
            .containers
            .lock()
            .get(id)
            .map(|c| c.host_port.clone()))
    }

    async fn stop_and_remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.removed.lock().push(id.to_string());
        self.containers.lock().remove(id);
        Ok(())
    }

    async fn list_managed(
        &self,
        include_stopped: bool,
    ) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        Ok(self
            .containers
            .lock()
            .iter()
            .filter(|(_, c)| include_stopped || c.running)
            .map(|(id, c)| RuntimeContainer {
                id: id.clone(),
                labels: c.labels.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        self.removed_images.lock().push(tag.to_string());
        Ok(())
    }

    async fn prune(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// A fully wired orchestrator over an in-memory database and mock runtime.
pub struct TestApp {
    pub router: axum::Router,
    pub config: Arc<Config>,
    pub db: Arc<dyn Database>,
    pub sqlite: SqliteDatabase,
    pub runtime: Arc<MockRuntime>,
    pub activity: ActivityTracker,
    pub lifecycle_tx: mpsc::Sender<LifecycleCmd>,
}

/// The default test configuration.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.base_domain = String::from(BASE_DOMAIN);
    config
}

/// Builds a test app with the default configuration.
pub async fn test_app() -> TestApp {
    test_app_with(test_config()).await
}

/// Builds a test app with the given configuration.
pub async fn test_app_with(config: Config) -> TestApp {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory database");

    let sqlite = SqliteDatabase::from_pool(pool)
        .await
        .expect("failed to migrate test database");
    let db: Arc<dyn Database> = Arc::new(sqlite.clone());

    let runtime = Arc::new(MockRuntime::new());
    let activity = ActivityTracker::new();
    let journal = Journal::new(db.clone());
    let config = Arc::new(config);

    let (_handle, lifecycle_tx) = LifecycleSvc::spawn(
        64,
        config.clone(),
        db.clone(),
        runtime.clone(),
        activity.clone(),
        journal.clone(),
    );

    let builder = Arc::new(ImageBuilder::new(runtime.clone(), db.clone(), journal.clone()));

    let state = AppState::builder()
        .config(config.clone())
        .db(db.clone())
        .runtime(runtime.clone())
        .builder(builder)
        .lifecycle_tx(lifecycle_tx.clone())
        .activity(activity.clone())
        .journal(journal)
        .build();

    let proxy_state = ProxyState {
        db: db.clone(),
        activity: activity.clone(),
        client: proxy::client(),
        timeout: Duration::from_secs(5),
    };

    let router = create_router(state)
        .layer(middleware::from_fn_with_state(proxy_state, proxy::layer));

    TestApp {
        router,
        config,
        db,
        sqlite,
        runtime,
        activity,
        lifecycle_tx,
    }
}

impl TestApp {
    /// Inserts an exercise directly into the catalog.
    pub async fn seed_exercise(&self, name: &str) -> Exercise {
        let id = Uuid::new_v4();
        self.db
            .create_exercise(
                id,
                name,
                "latest",
                "seeded test exercise",
                Level::Beginner,
                &format!("training/{}:{id}", name.to_lowercase().replace(' ', "-")),
                &serde_json::json!({ "title": name }),
            )
            .await
            .expect("failed to seed exercise")
    }

    /// Sends a launch command straight to the lifecycle service.
    pub async fn launch(
        &self,
        subject: &str,
        exercise_id: Uuid,
    ) -> Result<LaunchResponse, LaunchError> {
        let (tx, rx) = oneshot::channel();
        self.lifecycle_tx
            .send(LifecycleCmd::Launch {
                subject: subject.to_string(),
                exercise_id,
                rx: tx,
            })
            .await
            .expect("lifecycle service is gone");
        rx.await.expect("lifecycle service dropped the reply")
    }

    /// Sends a stop command straight to the lifecycle service.
    pub async fn stop(
        &self,
        container_id: &str,
        reason: StopReason,
        owner: Option<&str>,
    ) -> Result<StopResponse, StopError> {
        let (tx, rx) = oneshot::channel();
        self.lifecycle_tx
            .send(LifecycleCmd::Stop {
                container_id: container_id.to_string(),
                reason,
                owner: owner.map(String::from),
                rx: tx,
            })
            .await
            .expect("lifecycle service is gone");
        rx.await.expect("lifecycle service dropped the reply")
    }

    /// Sends a completion command straight to the lifecycle service.
    pub async fn complete(
        &self,
        subdomain: Uuid,
        payload: serde_json::Value,
    ) -> Result<CompleteResponse, CompleteError> {
        let (tx, rx) = oneshot::channel();
        self.lifecycle_tx
            .send(LifecycleCmd::Complete {
                subdomain,
                payload,
                rx: tx,
            })
            .await
            .expect("lifecycle service is gone");
        rx.await.expect("lifecycle service dropped the reply")
    }

    /// Requests a reconciliation and awaits its outcome.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, ReconcileError> {
        let (tx, rx) = oneshot::channel();
        self.lifecycle_tx
            .send(LifecycleCmd::Reconcile { rx: tx })
            .await
            .expect("lifecycle service is gone");
        rx.await.expect("lifecycle service dropped the reply")
    }
}

/// Builds a request carrying user credentials.
pub fn user_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(SUBJECT_HEADER, "user-1")
        .header(ROLE_HEADER, "user")
        .body(Body::empty())
        .unwrap()
}

/// Builds a request carrying admin credentials.
pub fn admin_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(SUBJECT_HEADER, "admin-1")
        .header(ROLE_HEADER, "admin")
        .body(Body::empty())
        .unwrap()
}

/// Collects a response body into JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("failed to collect body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is not JSON")
}

/// Assembles a zip bundle with a `Dockerfile` and the given metadata.
pub fn bundle_zip(metadata: &serde_json::Value) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();

        zip.start_file("Dockerfile", options).unwrap();
        zip.write_all(b"FROM nginx:alpine\nEXPOSE 8080\n").unwrap();

        zip.start_file("metadata.json", options).unwrap();
        zip.write_all(metadata.to_string().as_bytes()).unwrap();

        zip.finish().unwrap();
    }
    cursor.into_inner()
}

/// Frames bytes as a single-field `multipart/form-data` body.
pub fn multipart_body(filename: &str, bytes: &[u8]) -> (String, Vec<u8>) {
    let boundary = "sandcastle-test-boundary";
    let mut body = Vec::new();

    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"exercise\"; filename=\"{filename}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    (
        format!("multipart/form-data; boundary={boundary}"),
        body,
    )
}
