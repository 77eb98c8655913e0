//! Boundary to the container runtime.
//!
//! The watcher needs three things from the runtime: a snapshot of every
//! container, a single-container lookup, and a live event feed. A daemon
//! ping is used by the liveness prober.

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;

pub mod docker;

pub use docker::DockerRuntime;

/// Resource type of the events the watcher cares about.
pub const CONTAINER_RESOURCE: &str = "container";

/// Actions that count towards restart-loop detection.
pub const STOP_LIKE_ACTIONS: [&str; 4] = ["die", "oom", "kill", "stop"];

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),
}

/// Point-in-time view of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    /// Raw status as reported by the runtime, e.g. `running` or `exited`.
    pub status: Option<String>,
}

/// One lifecycle event from the runtime. Fields are optional because the
/// feed makes no guarantees about their presence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeEvent {
    pub resource_type: Option<String>,
    pub action: Option<String>,
    pub resource_id: Option<String>,
}

impl RuntimeEvent {
    pub fn is_container(&self) -> bool {
        self.resource_type.as_deref() == Some(CONTAINER_RESOURCE)
    }

    /// `die`, `oom`, `kill` and `stop`. Docker may suffix actions with
    /// details (`kill: 9`), only the verb is compared.
    pub fn is_stop_like(&self) -> bool {
        self.action
            .as_deref()
            .map(|action| action.split(':').next().unwrap_or_default().trim())
            .is_some_and(|verb| STOP_LIKE_ACTIONS.contains(&verb))
    }
}

/// Live events. Closed by the sender when the underlying stream ends;
/// an `Err` item is always the last one of a feed.
pub type EventFeed = Receiver<Result<RuntimeEvent, RuntimeError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError>;

    /// `Ok(None)` when the container no longer exists.
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerSnapshot>, RuntimeError>;

    async fn ping(&self) -> Result<(), RuntimeError>;

    fn subscribe_events(&self) -> EventFeed;
}
