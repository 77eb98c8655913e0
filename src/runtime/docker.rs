//! Docker runtime using bollard.
//!
//! Connects with the default local method (Unix socket on Linux/macOS,
//! named pipe on Windows) and honours `DOCKER_HOST`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage};
use bollard::query_parameters::{
    EventsOptions, EventsOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    ListContainersOptions, ListContainersOptionsBuilder,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{
    CONTAINER_RESOURCE, ContainerRuntime, ContainerSnapshot, EventFeed, RuntimeError,
    RuntimeEvent,
};
use crate::notify::message::display_name;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

impl From<EventMessage> for RuntimeEvent {
    fn from(message: EventMessage) -> Self {
        Self {
            resource_type: message.typ.map(|typ| typ.to_string()),
            action: message.action,
            resource_id: message.actor.and_then(|actor| actor.id),
        }
    }
}

fn snapshot_from_summary(summary: ContainerSummary) -> Option<ContainerSnapshot> {
    let id = summary.id?;
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| display_name(name).to_string())
        .unwrap_or_else(|| short(&id));
    Some(ContainerSnapshot {
        name,
        status: summary.state.as_ref().map(|state| state.to_string()),
        id,
    })
}

fn snapshot_from_inspect(id: &str, info: ContainerInspectResponse) -> ContainerSnapshot {
    let id = info.id.unwrap_or_else(|| id.to_string());
    let name = info
        .name
        .as_deref()
        .map(|name| display_name(name).to_string())
        .unwrap_or_else(|| short(&id));
    let status = info
        .state
        .and_then(|state| state.status)
        .map(|status| status.to_string());
    ContainerSnapshot { id, name, status }
}

fn short(id: &str) -> String {
    id.get(..12).unwrap_or(id).to_string()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(true).build();
        let summaries = self.docker.list_containers(Some(options)).await?;
        Ok(summaries
            .into_iter()
            .filter_map(snapshot_from_summary)
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerSnapshot>, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        match self.docker.inspect_container(id, Some(options)).await {
            Ok(info) => Ok(Some(snapshot_from_inspect(id, info))),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(RuntimeError::DockerApi(e)),
        }
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        let reply = self.docker.ping().await?;
        match reply.trim() {
            "OK" => Ok(()),
            other => Err(RuntimeError::Unavailable(format!(
                "unexpected ping reply {other:?}"
            ))),
        }
    }

    fn subscribe_events(&self) -> EventFeed {
        let docker = self.docker.clone();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert("type", vec![CONTAINER_RESOURCE]);
            let options: EventsOptions = EventsOptionsBuilder::new().filters(&filters).build();

            let mut stream = std::pin::pin!(docker.events(Some(options)));
            while let Some(item) = stream.next().await {
                let item = item.map(RuntimeEvent::from).map_err(RuntimeError::from);
                let is_err = item.is_err();
                // Receiver gone means the watcher moved on to a new feed.
                if tx.send(item).await.is_err() || is_err {
                    break;
                }
            }
            log::debug!("Docker event stream finished");
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerState, ContainerStateStatusEnum, EventActor, EventMessageTypeEnum};

    #[test]
    fn test_event_conversion() {
        let message = EventMessage {
            typ: Some(EventMessageTypeEnum::CONTAINER),
            action: Some("die".into()),
            actor: Some(EventActor {
                id: Some("abc123".into()),
                attributes: None,
            }),
            ..Default::default()
        };
        let event = RuntimeEvent::from(message);
        assert!(event.is_container());
        assert!(event.is_stop_like());
        assert_eq!(event.resource_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_snapshot_from_inspect() {
        let info = ContainerInspectResponse {
            id: Some("0123456789abcdef".into()),
            name: Some("/web".into()),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                ..Default::default()
            }),
            ..Default::default()
        };
        let snapshot = snapshot_from_inspect("0123456789abcdef", info);
        assert_eq!(snapshot.name, "web");
        assert_eq!(snapshot.status.as_deref(), Some("running"));
    }

    #[test]
    fn test_snapshot_without_name_uses_short_id() {
        let info = ContainerInspectResponse::default();
        let snapshot = snapshot_from_inspect("0123456789abcdef", info);
        assert_eq!(snapshot.id, "0123456789abcdef");
        assert_eq!(snapshot.name, "0123456789ab");
        assert_eq!(snapshot.status, None);
    }

    #[test]
    fn test_summary_without_id_is_dropped() {
        assert!(snapshot_from_summary(ContainerSummary::default()).is_none());
    }
}
