use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::engine::{HealthEngine, Status};
use crate::runtime::{ContainerRuntime, RuntimeError, RuntimeEvent};

/// Turns sweeps and events into engine observations. Both paths go through
/// the same normalization and the same state machine.
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    engine: HealthEngine,
}

impl Reconciler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, engine: HealthEngine) -> Self {
        Self { runtime, engine }
    }

    /// Observe every container. Returns how many were seen.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> Result<usize, RuntimeError> {
        let containers = self.runtime.list_containers().await?;
        for container in &containers {
            let status = Status::from_raw(container.status.as_deref());
            self.engine
                .observe(&container.id, &container.name, status, now)
                .await;
        }
        Ok(containers.len())
    }

    pub async fn handle_event(
        &mut self,
        event: &RuntimeEvent,
        now: DateTime<Utc>,
    ) -> Result<(), RuntimeError> {
        if !event.is_container() {
            return Ok(());
        }
        let Some(id) = event.resource_id.as_deref().filter(|id| !id.is_empty()) else {
            log::debug!("Ignoring container event without id: {event:?}");
            return Ok(());
        };

        let Some(container) = self.runtime.inspect_container(id).await? else {
            log::debug!("Container {id} vanished before it could be inspected");
            return Ok(());
        };

        let status = Status::from_raw(container.status.as_deref());
        self.engine
            .observe(&container.id, &container.name, status, now)
            .await;

        if event.is_stop_like() {
            self.engine.record_stop_event(&container.id, now).await;
        }
        Ok(())
    }

    pub fn tracked(&self) -> usize {
        self.engine.tracked()
    }

    #[cfg(test)]
    pub fn engine(&self) -> &HealthEngine {
        &self.engine
    }
}
