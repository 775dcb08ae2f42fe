//! Container runtime abstraction used by service discovery

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

/// A fresh read of one container. Never cached across events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub id: String,
    /// Runtime-assigned hostname, resolvable on the shared network
    pub hostname: Option<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSnapshot {
    /// Build the environment map from `KEY=value` entries. Later duplicates
    /// win; entries without `=` map to an empty value.
    pub fn env_from_list<I, S>(entries: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        entries
            .into_iter()
            .filter_map(|entry| {
                let entry = entry.as_ref();
                let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
                (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Die,
}

impl ContainerAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "start" => Some(ContainerAction::Start),
            "die" => Some(ContainerAction::Die),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub action: ContainerAction,
    pub container_id: String,
    pub attributes: HashMap<String, String>,
}

pub type EventStream = BoxStream<'static, Result<ContainerEvent, RuntimeError>>;

/// Operations discovery needs from the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ids of all running containers
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError>;

    /// `Ok(None)` when the container no longer exists
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerSnapshot>, RuntimeError>;

    /// Start and die events from now on
    fn events(&self) -> EventStream;

    /// Find a network by name, creating it when missing
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Attach a container to a network. Already attached is not an error.
    async fn connect_network(&self, network: &str, container_id: &str) -> Result<(), RuntimeError>;
}
