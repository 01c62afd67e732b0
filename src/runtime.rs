//! A thin contract over the container runtime.
//!
//! The orchestrator only ever talks to the runtime through
//! [`ContainerRuntime`], so tests can substitute a mock and the Docker
//! client stays confined to [`docker`].

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

pub mod docker;

pub use docker::DockerRuntime;

/// Label carrying the sandbox subdomain.
pub const LABEL_SUBDOMAIN: &str = "training.subdomain";

/// Label carrying the owning subject.
pub const LABEL_SUBJECT: &str = "training.subject";

/// Label carrying the exercise id.
pub const LABEL_EXERCISE: &str = "training.exercise";

/// Label marking containers managed by this orchestrator.
///
/// Used as the cross-check between the runtime and the registry during
/// reconciliation.
pub const LABEL_MANAGED: &str = "training.managed";

/// The TCP port sandbox images must listen on.
pub const SANDBOX_PORT: u16 = 8080;

/// Environment variable carrying the sandbox's subdomain.
pub const ENV_SUBDOMAIN: &str = "TRAINING_SUBDOMAIN";

/// Environment variable carrying the completion callback URL.
pub const ENV_CALLBACK_URL: &str = "CALLBACK_URL";

/// Container runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime daemon cannot be reached.
    #[error("container runtime is unavailable: {0}")]
    Unavailable(String),

    /// The requested image does not exist in the runtime.
    #[error("image not found: `{0}`")]
    ImageNotFound(String),

    /// The requested container does not exist in the runtime.
    #[error("container not found: `{0}`")]
    NotFound(String),

    /// The image build produced an error record.
    #[error("image build failed: {0}")]
    Build(String),

    /// Any other runtime API error.
    #[error(transparent)]
    Api(#[from] bollard::errors::Error),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Specification for creating and starting a sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Image tag to run.
    pub image: String,
    /// Container name (`training-<subdomain>`).
    pub name: String,
    /// The sandbox subdomain.
    pub subdomain: Uuid,
    /// The owning subject.
    pub subject: String,
    /// The exercise id.
    pub exercise_id: Uuid,
    /// Environment variables injected into the sandbox.
    pub env: Vec<(String, String)>,
    /// Runtime network the sandbox joins.
    pub network: String,
}

impl SandboxSpec {
    /// The label set attached to the sandbox container.
    pub fn labels(&self) -> HashMap<String, String> {
        HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_SUBDOMAIN.to_string(), self.subdomain.to_string()),
            (LABEL_SUBJECT.to_string(), self.subject.clone()),
            (LABEL_EXERCISE.to_string(), self.exercise_id.to_string()),
        ])
    }
}

/// A container as reported by the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeContainer {
    /// The runtime-assigned container id.
    pub id: String,
    /// The container's label set.
    pub labels: HashMap<String, String>,
    /// Whether the container is currently running.
    pub running: bool,
}

/// A thin contract over a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ensure the named network exists; idempotent.
    ///
    /// Transport errors are retried once before failing the call.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Build an image from a gzipped tar build context.
    ///
    /// The build stream is consumed to completion; the first progress record
    /// carrying an error fails the call.
    async fn build_image(&self, tag: &str, context: Bytes) -> Result<()>;

    /// Create and start a sandbox container.
    ///
    /// Port 8080/tcp is published to an ephemeral host port chosen by the
    /// runtime; the orchestrator never picks one. Returns the container id.
    async fn create_and_start(&self, spec: &SandboxSpec) -> Result<String>;

    /// Read back the host port bound to the sandbox port.
    ///
    /// Returns `None` when the runtime reports no binding.
    async fn inspect_host_port(&self, id: &str) -> Result<Option<String>>;

    /// Stop and remove a container.
    ///
    /// "Already stopped" and "already removed" are treated as success.
    async fn stop_and_remove(&self, id: &str) -> Result<()>;

    /// List containers carrying the orchestrator's managed label.
    async fn list_managed(&self, include_stopped: bool) -> Result<Vec<RuntimeContainer>>;

    /// Remove an image by tag.
    async fn remove_image(&self, tag: &str) -> Result<()>;

    /// Prune stopped managed containers; best-effort.
    async fn prune(&self) -> Result<()>;
}
