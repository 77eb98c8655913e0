use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

pub const RESTART_HISTORY_LEN: usize = 128;
pub const NOTIFY_HISTORY_LEN: usize = 256;

/// Normalized container status. Anything that is not explicitly running is
/// considered exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Exited,
}

impl AsRef<str> for Status {
    fn as_ref(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
        }
    }
}

impl Status {
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw {
            Some(raw) if raw.trim().eq_ignore_ascii_case("running") => Self::Running,
            _ => Self::Exited,
        }
    }
}

pub fn window_start(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn shift(at: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time-ordered buffer that silently drops its oldest entry when full.
#[derive(Debug, Clone)]
pub struct TimeRing {
    inner: VecDeque<DateTime<Utc>>,
    capacity: usize,
}

impl TimeRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>) {
        if self.inner.len() == self.capacity {
            self.inner.pop_front();
        }
        self.inner.push_back(at);
    }

    /// Number of entries at or after `now - window`.
    pub fn count_within(&self, now: DateTime<Utc>, window: TimeDelta) -> usize {
        let cutoff = window_start(now, window);
        self.inner.iter().filter(|at| **at >= cutoff).count()
    }

    /// Drop entries older than `now - window`.
    pub fn prune(&mut self, now: DateTime<Utc>, window: TimeDelta) {
        let cutoff = window_start(now, window);
        while self.inner.front().is_some_and(|at| *at < cutoff) {
            self.inner.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

/// Everything the engine knows about a single container.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub name: String,
    pub status: Status,
    pub down_since: Option<DateTime<Utc>>,
    pub next_recheck_at: Option<DateTime<Utc>>,
    pub down_alerted: bool,
    pub mute_until: DateTime<Utc>,
    pub backoff_level: u32,
    /// Last time the container was observed running.
    pub last_up_at: Option<DateTime<Utc>>,
    /// Start of the current uninterrupted running span.
    pub up_since: Option<DateTime<Utc>>,
    pub restart_history: TimeRing,
    pub loop_suppressed: bool,
    pub loop_alerts: u32,
    pub notify_history: TimeRing,
    pub muted_by_cap: bool,
}

impl ContainerRecord {
    pub fn new(name: String, status: Status) -> Self {
        Self {
            name,
            status,
            down_since: None,
            next_recheck_at: None,
            down_alerted: false,
            mute_until: DateTime::<Utc>::UNIX_EPOCH,
            backoff_level: 0,
            last_up_at: None,
            up_since: None,
            restart_history: TimeRing::new(RESTART_HISTORY_LEN),
            loop_suppressed: false,
            loop_alerts: 0,
            notify_history: TimeRing::new(NOTIFY_HISTORY_LEN),
            muted_by_cap: false,
        }
    }

    pub fn start_down_episode(&mut self, now: DateTime<Utc>, recheck: TimeDelta) {
        self.down_since = Some(now);
        self.next_recheck_at = Some(shift(now, recheck));
        self.up_since = None;
    }

    pub fn mark_up(&mut self, now: DateTime<Utc>) {
        self.last_up_at = Some(now);
        if self.up_since.is_none() {
            self.up_since = Some(now);
        }
    }

    /// Clears the per-episode flags and the backoff clock. Leaves the cap
    /// mute alone.
    pub fn end_down_episode(&mut self) {
        self.mute_until = DateTime::<Utc>::UNIX_EPOCH;
        self.backoff_level = 0;
        self.down_since = None;
        self.next_recheck_at = None;
        self.down_alerted = false;
        self.loop_suppressed = false;
        self.loop_alerts = 0;
    }

    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        now < self.mute_until
    }

    pub fn sustained_up(&self, now: DateTime<Utc>, quiet: TimeDelta) -> bool {
        self.up_since.is_some_and(|since| now - since >= quiet)
    }

    pub fn short_id(id: &str) -> &str {
        id.get(..12).unwrap_or(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_status_normalization() {
        assert_eq!(Status::from_raw(Some("running")), Status::Running);
        assert_eq!(Status::from_raw(Some("RUNNING")), Status::Running);
        assert_eq!(Status::from_raw(Some(" Running ")), Status::Running);
        assert_eq!(Status::from_raw(Some("restarting")), Status::Exited);
        assert_eq!(Status::from_raw(Some("paused")), Status::Exited);
        assert_eq!(Status::from_raw(Some("")), Status::Exited);
        assert_eq!(Status::from_raw(None), Status::Exited);
    }

    #[test]
    fn test_time_ring_drops_oldest_when_full() {
        let mut ring = TimeRing::new(3);
        for i in 0..5 {
            ring.push(at(i));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.count_within(at(4), TimeDelta::seconds(2)), 3);
    }

    #[test]
    fn test_time_ring_window() {
        let mut ring = TimeRing::new(10);
        for i in [0, 10, 20, 70] {
            ring.push(at(i));
        }
        assert_eq!(ring.count_within(at(70), TimeDelta::seconds(60)), 3);
        ring.prune(at(70), TimeDelta::seconds(60));
        assert_eq!(ring.len(), 3);
        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_end_down_episode_keeps_cap() {
        let mut record = ContainerRecord::new("web".into(), Status::Exited);
        record.start_down_episode(at(0), TimeDelta::seconds(60));
        record.down_alerted = true;
        record.loop_suppressed = true;
        record.muted_by_cap = true;
        record.backoff_level = 4;
        record.mute_until = at(500);

        record.end_down_episode();

        assert!(record.down_since.is_none());
        assert!(!record.down_alerted);
        assert!(!record.loop_suppressed);
        assert_eq!(record.backoff_level, 0);
        assert_eq!(record.mute_until, DateTime::<Utc>::UNIX_EPOCH);
        assert!(record.muted_by_cap);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(ContainerRecord::short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(ContainerRecord::short_id("abc"), "abc");
    }
}
