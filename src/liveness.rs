use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::notify::{MessageFormatter, Notifier};
use crate::runtime::ContainerRuntime;

/// Reachability of the container daemon as last seen by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DaemonState {
    #[default]
    Unknown,
    Up,
    Down,
}

impl DaemonState {
    /// Move to the state implied by a probe result and return whether an
    /// alert (`Some(up)`) has to go out. Startup never announces UP.
    pub fn transition(&mut self, reachable: bool) -> Option<bool> {
        let previous = *self;
        match (previous, reachable) {
            (Self::Down, true) => {
                *self = Self::Up;
                Some(true)
            }
            (Self::Unknown, true) => {
                *self = Self::Up;
                None
            }
            (Self::Up | Self::Unknown, false) => {
                *self = Self::Down;
                Some(false)
            }
            (Self::Up, true) | (Self::Down, false) => None,
        }
    }
}

/// Pings the daemon and raises or clears the daemon-level alert. These
/// alerts bypass backoff and the rolling cap.
pub struct LivenessProber {
    state: DaemonState,
    notifier: Arc<dyn Notifier>,
    formatter: Arc<MessageFormatter>,
}

impl LivenessProber {
    pub fn new(notifier: Arc<dyn Notifier>, formatter: Arc<MessageFormatter>) -> Self {
        Self {
            state: DaemonState::Unknown,
            notifier,
            formatter,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub async fn probe(&mut self, runtime: &dyn ContainerRuntime, now: DateTime<Utc>) {
        let reachable = match runtime.ping().await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Docker ping failed: {e}");
                false
            }
        };
        self.record(reachable, now).await;
    }

    async fn record(&mut self, reachable: bool, now: DateTime<Utc>) {
        let Some(up) = self.state.transition(reachable) else {
            return;
        };
        if up {
            log::info!("Docker daemon is reachable again");
        } else {
            log::warn!("Docker daemon is unreachable");
        }
        let notification = match self.formatter.daemon(up, now) {
            Ok(notification) => notification,
            Err(e) => {
                log::error!("Unable to render daemon alert: {e}");
                return;
            }
        };
        if let Err(e) = self.notifier.send(&notification).await {
            log::error!("Error sending daemon alert: {e}");
        }
    }
}
