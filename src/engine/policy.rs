use chrono::TimeDelta;

use crate::config::{CapStrategyKind, ThrottleConfig};

/// Backoff levels beyond this would only ever hit `backoff_max`.
pub const MAX_BACKOFF_LEVEL: u32 = 30;

/// How the engine limits the number of throttled alerts for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapStrategy {
    /// At most `max_notifies` delivered alerts within `window`. Once hit,
    /// the container stays muted until it has been running for
    /// `recovery_quiet`. One loop alert per down episode.
    RollingWindow {
        window: TimeDelta,
        max_notifies: usize,
        recovery_quiet: TimeDelta,
    },
    /// No rolling cap. Loop alerts are limited to `max_loop_alerts` between
    /// recoveries.
    PerEpisode { max_loop_alerts: u32 },
}

impl CapStrategy {
    /// Number of loop alerts allowed before `loop_suppressed` is set.
    pub fn loop_budget(&self) -> u32 {
        match self {
            CapStrategy::RollingWindow { .. } => 1,
            CapStrategy::PerEpisode { max_loop_alerts } => (*max_loop_alerts).max(1),
        }
    }
}

/// Thresholds of the health engine. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub down_grace: TimeDelta,
    pub down_recheck: TimeDelta,
    pub backoff_base: TimeDelta,
    pub backoff_max: TimeDelta,
    pub restarts_in_window: usize,
    pub restart_window: TimeDelta,
    pub include_recovery: bool,
    pub cap: CapStrategy,
}

pub(crate) fn secs(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

impl From<&ThrottleConfig> for ThrottlePolicy {
    fn from(config: &ThrottleConfig) -> Self {
        let cap = match config.cap_strategy {
            CapStrategyKind::RollingWindow => CapStrategy::RollingWindow {
                window: secs(config.notify_window_sec),
                max_notifies: config.max_notifies_in_window,
                recovery_quiet: secs(config.recovery_quiet_sec),
            },
            CapStrategyKind::PerEpisode => CapStrategy::PerEpisode {
                max_loop_alerts: config.max_loop_alerts,
            },
        };
        Self {
            down_grace: secs(config.down_grace_sec),
            down_recheck: secs(config.down_recheck_sec),
            backoff_base: secs(config.backoff_base_sec),
            backoff_max: secs(config.backoff_max_sec),
            restarts_in_window: config.restarts_in_window,
            restart_window: secs(config.restart_window_sec),
            include_recovery: config.include_recovery,
            cap,
        }
    }
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::from(&ThrottleConfig::default())
    }
}

impl ThrottlePolicy {
    /// `min(backoff_base * 2^level, backoff_max)`, saturating.
    pub fn backoff_delay(&self, level: u32) -> TimeDelta {
        let level = level.min(MAX_BACKOFF_LEVEL);
        let base = self.backoff_base.num_seconds().max(0);
        let max = self.backoff_max.num_seconds().max(0);
        let factor = 1_i64 << level;
        TimeDelta::seconds(base.saturating_mul(factor).min(max))
    }

    /// The sustained-uptime requirement that lifts a cap mute. Zero when
    /// the strategy has no rolling cap.
    pub fn recovery_quiet(&self) -> TimeDelta {
        match self.cap {
            CapStrategy::RollingWindow { recovery_quiet, .. } => recovery_quiet,
            CapStrategy::PerEpisode { .. } => TimeDelta::zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn policy(base: u64, max: u64) -> ThrottlePolicy {
        ThrottlePolicy {
            backoff_base: secs(base),
            backoff_max: secs(max),
            ..ThrottlePolicy::default()
        }
    }

    #[test]
    fn test_backoff_doubles_until_max() {
        let policy = policy(60, 3600);
        let delays: Vec<i64> = (0..8)
            .map(|level| policy.backoff_delay(level).num_seconds())
            .collect();
        assert_eq!(delays, vec![60, 120, 240, 480, 960, 1920, 3600, 3600]);
    }

    #[test]
    fn test_backoff_level_is_clamped() {
        let policy = policy(1, i64::MAX as u64 / 2_000);
        assert_eq!(policy.backoff_delay(64), policy.backoff_delay(MAX_BACKOFF_LEVEL));
    }

    #[test]
    fn test_loop_budget() {
        let rolling = ThrottlePolicy::default();
        assert_eq!(rolling.cap.loop_budget(), 1);
        let per_episode = CapStrategy::PerEpisode { max_loop_alerts: 0 };
        assert_eq!(per_episode.loop_budget(), 1);
        let per_episode = CapStrategy::PerEpisode { max_loop_alerts: 4 };
        assert_eq!(per_episode.loop_budget(), 4);
    }

    #[quickcheck]
    fn prop_backoff_is_monotonic_and_bounded(base: u16, max: u16, level: u8) -> bool {
        let policy = policy(base as u64, max as u64);
        let level = level as u32 % (MAX_BACKOFF_LEVEL + 1);
        let current = policy.backoff_delay(level);
        let next = policy.backoff_delay(level + 1);
        current <= next && next <= secs(max as u64)
    }

    #[quickcheck]
    fn prop_backoff_matches_formula(base: u8, level: u8) -> bool {
        let level = level as u32 % 20;
        let policy = policy(base as u64, 1 << 40);
        policy.backoff_delay(level).num_seconds() == (base as i64) << level
    }
}
