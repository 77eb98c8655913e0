//! The watcher loop.
//!
//! A single task owns the reconciler (and with it the engine table) and the
//! liveness prober. Events, sweeps, pings and shutdown are multiplexed with
//! `tokio::select!`, so observations are handled strictly one at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc::Receiver;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ScheduleConfig;
use crate::liveness::LivenessProber;
use crate::reconcile::Reconciler;
use crate::runtime::{ContainerRuntime, EventFeed, RuntimeError, RuntimeEvent};

/// Doubling delay between event feed subscriptions, with up to 25% of
/// random jitter on top.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay without jitter for the upcoming attempt.
    pub fn current(&self) -> Duration {
        self.base
            .saturating_mul(1_u32 << self.attempt.min(16))
            .min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.attempt = self.attempt.saturating_add(1);
        let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
        let jitter = rand::rng().random_range(0..=spread);
        delay.saturating_add(Duration::from_millis(jitter))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub struct Watcher {
    runtime: Arc<dyn ContainerRuntime>,
    reconciler: Reconciler,
    prober: LivenessProber,
    sweep_every: Duration,
    ping_every: Duration,
    reconnect: ReconnectBackoff,
}

/// Next item of the feed, or never when there is no feed.
async fn next_event(feed: &mut Option<EventFeed>) -> Option<Result<RuntimeEvent, RuntimeError>> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

impl Watcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        reconciler: Reconciler,
        prober: LivenessProber,
        schedule: &ScheduleConfig,
    ) -> Self {
        Self {
            runtime,
            reconciler,
            prober,
            sweep_every: Duration::from_secs(schedule.sweep_every_sec.max(1)),
            ping_every: Duration::from_secs(schedule.ping_every_sec.max(1)),
            reconnect: ReconnectBackoff::new(
                Duration::from_secs(schedule.reconnect_base_sec.max(1)),
                Duration::from_secs(schedule.reconnect_max_sec),
            ),
        }
    }

    /// Run until `shutdown` yields or is closed.
    pub async fn run(mut self, mut shutdown: Receiver<()>) {
        match self.reconciler.sweep(Utc::now()).await {
            Ok(count) => log::info!("Seeded {count} container states"),
            Err(e) => log::warn!("Initial sweep failed: {e}"),
        }
        self.prober.probe(self.runtime.as_ref(), Utc::now()).await;

        let mut sweep = tokio::time::interval_at(Instant::now() + self.sweep_every, self.sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping = tokio::time::interval_at(Instant::now() + self.ping_every, self.ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut feed = Some(self.runtime.subscribe_events());
        log::info!("Watching Docker events");
        let reconnect = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(reconnect);

        loop {
            tokio::select! {
                item = next_event(&mut feed) => match item {
                    Some(Ok(event)) => {
                        self.reconnect.reset();
                        if let Err(e) = self.reconciler.handle_event(&event, Utc::now()).await {
                            log::warn!("Error handling {:?} event: {e}", event.action);
                        }
                    }
                    Some(Err(e)) => {
                        feed = None;
                        let delay = self.reconnect.next_delay();
                        log::warn!("Event stream error: {e}. Reconnecting in {delay:?}");
                        reconnect.as_mut().reset(Instant::now() + delay);
                    }
                    None => {
                        feed = None;
                        let delay = self.reconnect.next_delay();
                        log::warn!("Event stream ended. Reconnecting in {delay:?}");
                        reconnect.as_mut().reset(Instant::now() + delay);
                    }
                },
                _ = &mut reconnect, if feed.is_none() => {
                    log::info!("Resubscribing to Docker events");
                    feed = Some(self.runtime.subscribe_events());
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.reconciler.sweep(Utc::now()).await {
                        log::warn!("Sweep failed: {e}");
                    }
                }
                _ = ping.tick() => {
                    self.prober.probe(self.runtime.as_ref(), Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    log::info!(
                        "Stopping watcher with {} tracked containers, daemon {:?}",
                        self.reconciler.tracked(),
                        self.prober.state()
                    );
                    break;
                }
            }
        }
    }
}
