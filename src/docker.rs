//! Docker implementation of [`ContainerRuntime`]

use crate::runtime::{
    ContainerAction, ContainerEvent, ContainerRuntime, ContainerSnapshot, EventStream, RuntimeError,
};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::EventMessage;
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

/// Talks to the Docker daemon over its API socket
#[derive(Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter (config or `DOCKER_HOST`)
    /// 2. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) => Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?,
            None => Self::connect_with_defaults().await?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running and its socket is mounted.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with("/.") || !std::path::Path::new(path).exists() {
                continue;
            }
            debug!(path, name, "Found Docker socket");
            if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. Mount /var/run/docker.sock or set DOCKER_HOST.",
                e
            )
        })
    }
}

fn api_error(operation: &'static str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError { message, .. } => RuntimeError::Api { operation, message },
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

/// Map a Docker event to a start/die event, skipping everything else
fn container_event(message: EventMessage) -> Option<ContainerEvent> {
    let action = ContainerAction::parse(message.action.as_deref()?)?;
    let actor = message.actor?;
    Some(ContainerEvent {
        action,
        container_id: actor.id?,
        attributes: actor.attributes.unwrap_or_default(),
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| api_error("list containers", e))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerSnapshot>, RuntimeError> {
        let info = match self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(container_id, "Container not found");
                return Ok(None);
            }
            Err(e) => return Err(api_error("inspect container", e)),
        };

        let config = info.config.unwrap_or_default();
        Ok(Some(ContainerSnapshot {
            id: info.id.unwrap_or_else(|| container_id.to_string()),
            hostname: config.hostname.filter(|h| !h.is_empty()),
            env: ContainerSnapshot::env_from_list(config.env.unwrap_or_default()),
            labels: config.labels.unwrap_or_default(),
        }))
    }

    fn events(&self) -> EventStream {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert("event".to_string(), vec!["start".to_string(), "die".to_string()]);

        self.client
            .events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }))
            .filter_map(|item| async move {
                match item {
                    Ok(message) => container_event(message).map(Ok),
                    Err(e) => Some(Err(api_error("event stream", e))),
                }
            })
            .boxed()
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let networks = self
            .client
            .list_networks(Some(ListNetworksOptions::<String> { filters }))
            .await
            .map_err(|e| api_error("list networks", e))?;

        // the name filter matches substrings
        if networks.iter().any(|n| n.name.as_deref() == Some(name)) {
            debug!(network = name, "Network exists");
            return Ok(());
        }

        self.client
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| api_error("create network", e))?;

        info!(network = name, "Created network");
        Ok(())
    }

    async fn connect_network(&self, network: &str, container_id: &str) -> Result<(), RuntimeError> {
        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            ..Default::default()
        };

        match self.client.connect_network(network, options).await {
            Ok(()) => {
                info!(network, container_id, "Connected container to network");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 403, .. })
            | Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => {
                debug!(network, container_id, "Container already attached to network");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { message, .. })
                if message.contains("already exists") =>
            {
                debug!(network, container_id, "Container already attached to network");
                Ok(())
            }
            Err(e) => Err(api_error("connect network", e)),
        }
    }
}
