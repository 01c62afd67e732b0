//! Docker implementation of the container runtime contract.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::Config;
use bollard::container::CreateContainerOptions;
use bollard::container::ListContainersOptions;
use bollard::container::PruneContainersOptions;
use bollard::container::RemoveContainerOptions;
use bollard::container::StopContainerOptions;
use bollard::image::BuildImageOptions;
use bollard::image::RemoveImageOptions;
use bollard::network::CreateNetworkOptions;
use bollard::network::ListNetworksOptions;
use bollard::service::HostConfig;
use bollard::service::PortBinding;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;
use tracing::warn;

use super::ContainerRuntime;
use super::Result;
use super::RuntimeContainer;
use super::RuntimeError;
use super::SandboxSpec;
use super::LABEL_MANAGED;
use super::SANDBOX_PORT;

/// Seconds a container is given to stop before it is killed.
const STOP_TIMEOUT_SECS: i64 = 10;

/// The Docker-backed container runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    /// The bollard client; connection-pooled internally.
    client: Docker,
}

/// Extracts the HTTP status of a Docker API error response, if any.
fn response_status(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

/// Maps a bollard error onto the runtime error taxonomy.
///
/// Errors without a Docker API response (I/O, timeouts) mean the daemon is
/// unreachable.
fn map_err(err: bollard::errors::Error) -> RuntimeError {
    if response_status(&err).is_some() {
        RuntimeError::Api(err)
    } else {
        RuntimeError::Unavailable(err.to_string())
    }
}

/// The published port key for the sandbox port, e.g. `8080/tcp`.
fn sandbox_port_key() -> String {
    format!("{SANDBOX_PORT}/tcp")
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be configured; reachability is
    /// verified lazily on first use.
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults().map_err(map_err)?;
        Ok(Self { client })
    }

    /// Checks whether the named network exists, creating it if missing.
    async fn ensure_network_once(&self, name: &str) -> Result<()> {
        let filters = HashMap::from([("name".to_string(), vec![name.to_string()])]);
        let existing = self
            .client
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(map_err)?;

        if existing
            .iter()
            .any(|n| n.name.as_deref() == Some(name))
        {
            return Ok(());
        }

        debug!(network = name, "creating runtime network");
        match self
            .client
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(()),
            // Lost a race with a concurrent creation.
            Err(err) if response_status(&err) == Some(409) => Ok(()),
            Err(err) => Err(map_err(err)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_network(&self, name: &str) -> Result<()> {
        match self.ensure_network_once(name).await {
            Err(RuntimeError::Unavailable(reason)) => {
                debug!(network = name, %reason, "retrying network check after transport error");
                self.ensure_network_once(name).await
            }
            other => other,
        }
    }

    async fn build_image(&self, tag: &str, context: Bytes) -> Result<()> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: tag,
            rm: true,
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(context));

        while let Some(record) = stream.next().await {
            let record = record.map_err(map_err)?;
            if let Some(progress) = record.stream {
                let progress = progress.trim();
                if !progress.is_empty() {
                    debug!(tag, "{progress}");
                }
            }
            if let Some(error) = record.error {
                return Err(RuntimeError::Build(error));
            }
        }

        Ok(())
    }

    async fn create_and_start(&self, spec: &SandboxSpec) -> Result<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let port_key = sandbox_port_key();

        // The runtime picks the ephemeral host port; the orchestrator never
        // does. Binding to loopback keeps sandboxes reachable only through
        // the proxy.
        let port_bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: None,
            }]),
        )]);

        let exposed_ports = HashMap::from([(port_key, HashMap::new())]);

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(spec.network.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let created = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|err| match response_status(&err) {
                Some(404) => RuntimeError::ImageNotFound(spec.image.clone()),
                _ => map_err(err),
            })?;

        if let Err(err) = self.client.start_container::<String>(&created.id, None).await {
            // Don't leave a created-but-never-started container behind.
            if let Err(remove_err) = self.stop_and_remove(&created.id).await {
                warn!(
                    id = %created.id,
                    error = %remove_err,
                    "failed to clean up container after start failure"
                );
            }
            return Err(map_err(err));
        }

        Ok(created.id)
    }

    async fn inspect_host_port(&self, id: &str) -> Result<Option<String>> {
        let info = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|err| match response_status(&err) {
                Some(404) => RuntimeError::NotFound(id.to_string()),
                _ => map_err(err),
            })?;

        let host_port = info
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&sandbox_port_key()).cloned())
            .flatten()
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port));

        Ok(host_port)
    }

    async fn stop_and_remove(&self, id: &str) -> Result<()> {
        let stop = self
            .client
            .stop_container(id, Some(StopContainerOptions {
                t: STOP_TIMEOUT_SECS,
            }))
            .await;

        match stop {
            Ok(()) => {}
            // 304: already stopped; 404: already removed.
            Err(err) if matches!(response_status(&err), Some(304) | Some(404)) => {}
            Err(err) => return Err(map_err(err)),
        }

        let remove = self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;

        match remove {
            Ok(()) => Ok(()),
            Err(err) if response_status(&err) == Some(404) => Ok(()),
            Err(err) => Err(map_err(err)),
        }
    }

    async fn list_managed(&self, include_stopped: bool) -> Result<Vec<RuntimeContainer>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED}=true")],
        )]);

        let options = ListContainersOptions {
            all: include_stopped,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(map_err)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let running = c
                    .state
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case("running"));
                Some(RuntimeContainer {
                    id,
                    labels: c.labels.unwrap_or_default(),
                    running,
                })
            })
            .collect())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let result = self
            .client
            .remove_image(
                tag,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if response_status(&err) == Some(404) => Ok(()),
            Err(err) => Err(map_err(err)),
        }
    }

    async fn prune(&self) -> Result<()> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED}=true")],
        )]);

        let report = self
            .client
            .prune_containers(Some(PruneContainersOptions { filters }))
            .await
            .map_err(map_err)?;

        if let Some(deleted) = report.containers_deleted {
            if !deleted.is_empty() {
                debug!(count = deleted.len(), "pruned stopped sandbox containers");
            }
        }

        Ok(())
    }
}
