//! Health and alert-throttling state machine.
//!
//! The engine keeps one [`ContainerRecord`] per container id and decides,
//! for every observation, whether an alert should go out. Throttled alerts
//! (down and restart-loop) pass through two gates before delivery:
//!
//! 1. the cap gate, closed while `muted_by_cap` is set and the container has
//!    not been running for the recovery quiet period;
//! 2. the backoff gate, closed while `now < mute_until`.
//!
//! Recovery notices bypass both. Time is always passed in by the caller.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::notify::{MessageFormatter, Notification, Notifier};

pub mod policy;
pub mod record;

pub use policy::{CapStrategy, ThrottlePolicy};
pub use record::{ContainerRecord, Status};

use policy::MAX_BACKOFF_LEVEL;
use record::shift;

/// Policy, formatter and sink. Split from the record table so a record can
/// be borrowed mutably while alerts are dispatched.
struct Alerter {
    policy: ThrottlePolicy,
    notifier: Arc<dyn Notifier>,
    formatter: Arc<MessageFormatter>,
}

pub struct HealthEngine {
    records: HashMap<String, ContainerRecord>,
    alerter: Alerter,
}

impl HealthEngine {
    pub fn new(
        policy: ThrottlePolicy,
        notifier: Arc<dyn Notifier>,
        formatter: Arc<MessageFormatter>,
    ) -> Self {
        Self {
            records: HashMap::new(),
            alerter: Alerter {
                policy,
                notifier,
                formatter,
            },
        }
    }

    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn record(&self, id: &str) -> Option<&ContainerRecord> {
        self.records.get(id)
    }

    /// Feed one normalized status observation into the state machine.
    pub async fn observe(&mut self, id: &str, name: &str, status: Status, now: DateTime<Utc>) {
        let Some(record) = self.records.get_mut(id) else {
            let mut record = ContainerRecord::new(name.to_string(), status);
            match status {
                Status::Running => record.mark_up(now),
                Status::Exited => record.start_down_episode(now, self.alerter.policy.down_recheck),
            }
            log::debug!(
                "Tracking {} ({}) as {}",
                name,
                ContainerRecord::short_id(id),
                status.as_ref()
            );
            self.records.insert(id.to_string(), record);
            return;
        };

        if record.name != name {
            record.name = name.to_string();
        }
        let previous = record.status;
        record.status = status;

        match (previous, status) {
            (Status::Running, Status::Exited) => {
                log::info!("{} ({}) went down", record.name, ContainerRecord::short_id(id));
                record.start_down_episode(now, self.alerter.policy.down_recheck);
                self.alerter.evaluate_down(id, record, now).await;
            }
            (Status::Exited, Status::Exited) => {
                self.alerter.evaluate_down(id, record, now).await;
            }
            (Status::Exited, Status::Running) => {
                self.alerter.recover(id, record, now).await;
            }
            (Status::Running, Status::Running) => {
                record.mark_up(now);
                self.alerter.maybe_clear_cap(id, record, now);
            }
        }
    }

    /// Register a stop-like event (`die`, `oom`, `kill`, `stop`) and raise a
    /// restart-loop alert once enough of them fall within the window.
    /// Containers that were never observed are ignored.
    pub async fn record_stop_event(&mut self, id: &str, now: DateTime<Utc>) {
        let Some(record) = self.records.get_mut(id) else {
            log::debug!("Stop event for untracked container {}", ContainerRecord::short_id(id));
            return;
        };
        let policy = &self.alerter.policy;

        record.restart_history.push(now);
        let count = record
            .restart_history
            .count_within(now, policy.restart_window);
        if count < policy.restarts_in_window {
            return;
        }
        if record.loop_suppressed {
            log::debug!(
                "[LOOP] {} stopped {count} times, loop alerts suppressed until recovery",
                record.name
            );
            return;
        }

        log::info!(
            "[LOOP] {} stopped {count} times within {}s",
            record.name,
            policy.restart_window.num_seconds()
        );
        if !self.alerter.gate(id, record, now, "Loop") {
            return;
        }
        let notification = self.alerter.formatter.looping(
            &record.name,
            count,
            self.alerter.policy.restart_window.num_seconds(),
            now,
        );
        // Counted even when every inspect reads running; only recovery resets it.
        if self.alerter.dispatch(record, notification, now).await {
            record.loop_alerts += 1;
            if record.loop_alerts >= self.alerter.policy.cap.loop_budget() {
                record.loop_suppressed = true;
            }
        }
    }
}

impl Alerter {
    async fn evaluate_down(&self, id: &str, record: &mut ContainerRecord, now: DateTime<Utc>) {
        let Some(down_since) = record.down_since else {
            return;
        };
        if record.down_alerted {
            return;
        }
        if now - down_since < self.policy.down_grace {
            return;
        }
        if record.next_recheck_at.is_some_and(|recheck| now < recheck) {
            return;
        }
        if !self.gate(id, record, now, "Down") {
            return;
        }
        let notification = self.formatter.down(&record.name, now);
        if self.dispatch(record, notification, now).await {
            record.down_alerted = true;
        }
    }

    async fn recover(&self, id: &str, record: &mut ContainerRecord, now: DateTime<Utc>) {
        log::info!("{} ({}) is back up", record.name, ContainerRecord::short_id(id));
        if self.policy.include_recovery {
            match self.formatter.back_up(&record.name, now) {
                Ok(notification) => {
                    if let Err(e) = self.notifier.send(&notification).await {
                        log::error!("Error sending recovery notice for {}: {e}", record.name);
                    }
                }
                Err(e) => log::error!("Unable to render recovery notice: {e}"),
            }
        }
        record.end_down_episode();
        record.mark_up(now);
        self.maybe_clear_cap(id, record, now);
    }

    fn maybe_clear_cap(&self, id: &str, record: &mut ContainerRecord, now: DateTime<Utc>) {
        if record.muted_by_cap && record.sustained_up(now, self.policy.recovery_quiet()) {
            record.muted_by_cap = false;
            if !record.notify_history.is_empty() {
                log::debug!(
                    "[CAP] Dropping {} alert timestamps for {}",
                    record.notify_history.len(),
                    record.name
                );
                record.notify_history.clear();
            }
            log::info!(
                "[CAP] Unmuted alerts for {} after sustained recovery",
                ContainerRecord::short_id(id)
            );
        }
    }

    /// Returns whether a throttled alert may be sent right now.
    fn gate(&self, id: &str, record: &mut ContainerRecord, now: DateTime<Utc>, kind: &str) -> bool {
        self.maybe_clear_cap(id, record, now);
        if record.muted_by_cap {
            log::info!(
                "[CAP] {kind} alert muted for {} (awaiting recovery quiet period)",
                record.name
            );
            return false;
        }
        if record.in_backoff(now) {
            log::info!(
                "[BACKOFF] {kind} alert muted for {} until {}",
                record.name,
                record.mute_until
            );
            return false;
        }
        true
    }

    /// Deliver a throttled alert and advance the throttle state. Nothing is
    /// touched when rendering or delivery fails.
    async fn dispatch(
        &self,
        record: &mut ContainerRecord,
        notification: Result<Notification, minijinja::Error>,
        now: DateTime<Utc>,
    ) -> bool {
        let notification = match notification {
            Ok(notification) => notification,
            Err(e) => {
                log::error!("Unable to render alert for {}: {e}", record.name);
                return false;
            }
        };
        if let Err(e) = self.notifier.send(&notification).await {
            log::error!("Error sending alert for {}: {e}", record.name);
            return false;
        }

        if let CapStrategy::RollingWindow {
            window,
            max_notifies,
            ..
        } = self.policy.cap
        {
            record.notify_history.push(now);
            record.notify_history.prune(now, window);
            if record.notify_history.len() >= max_notifies {
                record.muted_by_cap = true;
                log::warn!(
                    "[CAP] Muted further alerts for {} until recovery quiet period",
                    record.name
                );
            }
        }

        let delay = self.policy.backoff_delay(record.backoff_level);
        record.mute_until = record.mute_until.max(shift(now, delay));
        record.backoff_level = (record.backoff_level + 1).min(MAX_BACKOFF_LEVEL);
        true
    }
}
