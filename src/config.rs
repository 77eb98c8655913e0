//! Watcher configuration.
//!
//! Settings are resolved in three layers: built-in defaults, then the
//! optional TOML file given with `--config`, then environment variables
//! (a `.env` file is loaded into the environment first). Environment
//! variables keep the historical names, e.g. `SMTP_HOST` or
//! `DOWN_GRACE_SEC`.
//!
//! ```toml
//! hostname = "node-1"
//!
//! [smtp]
//! host = "mail.example.com"
//! port = 587
//! to = ["ops@example.com"]
//! tls = "starttls"
//!
//! [throttle]
//! down_grace_sec = 120
//! cap_strategy = "per-episode"
//! max_loop_alerts = 2
//!
//! [templates]
//! down_subject = "[${ host }] ${ name } is down"
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::notify::MessageFormatter;
use crate::notify::message::MessageTemplates;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("Invalid setting: {0}")]
    Invalid(String),
    #[error("Templating error: {0}")]
    Template(#[from] minijinja::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TlsMode {
    #[default]
    #[serde(alias = "none", alias = "off")]
    None,
    /// Upgrade a plain connection with STARTTLS.
    #[serde(alias = "starttls", alias = "start-tls", alias = "start_tls")]
    StartTls,
    /// Connect over TLS from the first byte (usually port 465).
    #[serde(alias = "implicit", alias = "wrapper", alias = "smtps")]
    Implicit,
}

impl TlsMode {
    fn from_env(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" | "starttls" => Self::StartTls,
            "implicit" | "wrapper" | "smtps" => Self::Implicit,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub to: Vec<String>,
    pub tls: TlsMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    pub timeout_sec: f64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "mail".into(),
            port: 25,
            from: "docker-watcher@localhost".into(),
            to: vec!["root@localhost".into()],
            tls: TlsMode::None,
            user: None,
            pass: None,
            timeout_sec: 15.0,
        }
    }
}

/// Which cap the engine applies on top of the per-container backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CapStrategyKind {
    #[default]
    #[serde(
        alias = "rolling-window",
        alias = "rolling_window",
        alias = "rolling",
        alias = "window"
    )]
    RollingWindow,
    #[serde(alias = "per-episode", alias = "per_episode", alias = "episode")]
    PerEpisode,
}

impl FromStr for CapStrategyKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rolling-window" | "rolling_window" | "rollingwindow" | "rolling" | "window" => {
                Ok(Self::RollingWindow)
            }
            "per-episode" | "per_episode" | "perepisode" | "episode" => Ok(Self::PerEpisode),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub down_grace_sec: u64,
    pub down_recheck_sec: u64,
    pub backoff_base_sec: u64,
    pub backoff_max_sec: u64,
    pub restarts_in_window: usize,
    pub restart_window_sec: u64,
    pub include_recovery: bool,
    pub notify_window_sec: u64,
    pub max_notifies_in_window: usize,
    pub recovery_quiet_sec: u64,
    pub cap_strategy: CapStrategyKind,
    pub max_loop_alerts: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            down_grace_sec: 60,
            down_recheck_sec: 60,
            backoff_base_sec: 60,
            backoff_max_sec: 3600,
            restarts_in_window: 3,
            restart_window_sec: 60,
            include_recovery: true,
            notify_window_sec: 3600,
            max_notifies_in_window: 3,
            recovery_quiet_sec: 600,
            cap_strategy: CapStrategyKind::RollingWindow,
            max_loop_alerts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Seconds between two full container sweeps.
    pub sweep_every_sec: u64,
    /// Seconds between two daemon pings.
    pub ping_every_sec: u64,
    pub reconnect_base_sec: u64,
    pub reconnect_max_sec: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sweep_every_sec: 10,
            ping_every_sec: 60,
            reconnect_base_sec: 3,
            reconnect_max_sec: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WatcherConfig {
    /// Host name used in messages. Defaults to the system hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub smtp: SmtpConfig,
    pub throttle: ThrottleConfig,
    pub schedule: ScheduleConfig,
    pub templates: MessageTemplates,
}

fn truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_env<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: raw.to_string(),
    })
}

fn non_empty(raw: String) -> Option<String> {
    match raw.trim() {
        "" => None,
        _ => Some(raw),
    }
}

impl WatcherConfig {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    fn try_init_from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::try_init_from_string(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config file at {path:?}, using defaults and environment");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load the configuration the way the binary does: `.env`, the TOML
    /// file, then the process environment.
    pub fn try_init() -> Result<Self, ConfigError> {
        let args = crate::cli::get_cli_args();
        match dotenv::from_path(&args.env_file) {
            Ok(()) => log::debug!("Loaded environment from {:?}", args.env_file),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("Unable to read {:?}: {e}", args.env_file),
        }

        let mut config = Self::try_init_from_file(&args.config)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override settings from environment variables. `lookup` returns the
    /// raw value of a variable, if set.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let smtp = &mut self.smtp;
        if let Some(v) = lookup("SMTP_HOST") {
            smtp.host = v;
        }
        if let Some(v) = lookup("SMTP_PORT") {
            smtp.port = parse_env("SMTP_PORT", &v)?;
        }
        if let Some(v) = lookup("SMTP_FROM") {
            smtp.from = v;
        }
        if let Some(v) = lookup("SMTP_TO") {
            smtp.to = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("SMTP_TLS") {
            smtp.tls = TlsMode::from_env(&v);
        }
        if let Some(v) = lookup("SMTP_USER") {
            smtp.user = non_empty(v);
        }
        if let Some(v) = lookup("SMTP_PASS") {
            smtp.pass = non_empty(v);
        }
        if let Some(v) = lookup("SMTP_TIMEOUT") {
            smtp.timeout_sec = parse_env("SMTP_TIMEOUT", &v)?;
        }

        let throttle = &mut self.throttle;
        if let Some(v) = lookup("RESTARTS_IN_WINDOW") {
            throttle.restarts_in_window = parse_env("RESTARTS_IN_WINDOW", &v)?;
        }
        if let Some(v) = lookup("RESTART_WINDOW_SEC") {
            throttle.restart_window_sec = parse_env("RESTART_WINDOW_SEC", &v)?;
        }
        if let Some(v) = lookup("BACKOFF_BASE_SEC") {
            throttle.backoff_base_sec = parse_env("BACKOFF_BASE_SEC", &v)?;
        }
        if let Some(v) = lookup("BACKOFF_MAX_SEC") {
            throttle.backoff_max_sec = parse_env("BACKOFF_MAX_SEC", &v)?;
        }
        if let Some(v) = lookup("INCLUDE_RECOVERY") {
            throttle.include_recovery = truthy(&v);
        }
        if let Some(v) = lookup("DOWN_GRACE_SEC") {
            throttle.down_grace_sec = parse_env("DOWN_GRACE_SEC", &v)?;
        }
        if let Some(v) = lookup("DOWN_RECHECK_SEC") {
            throttle.down_recheck_sec = parse_env("DOWN_RECHECK_SEC", &v)?;
        }
        if let Some(v) = lookup("NOTIFY_WINDOW_SEC") {
            throttle.notify_window_sec = parse_env("NOTIFY_WINDOW_SEC", &v)?;
        }
        if let Some(v) = lookup("MAX_NOTIFIES_IN_WINDOW") {
            throttle.max_notifies_in_window = parse_env("MAX_NOTIFIES_IN_WINDOW", &v)?;
        }
        if let Some(v) = lookup("RECOVERY_QUIET_SEC") {
            throttle.recovery_quiet_sec = parse_env("RECOVERY_QUIET_SEC", &v)?;
        }
        if let Some(v) = lookup("CAP_STRATEGY") {
            throttle.cap_strategy = parse_env("CAP_STRATEGY", &v)?;
        }
        if let Some(v) = lookup("MAX_LOOP_ALERTS") {
            throttle.max_loop_alerts = parse_env("MAX_LOOP_ALERTS", &v)?;
        }

        let schedule = &mut self.schedule;
        if let Some(v) = lookup("SWEEP_ALL_EVERY_SEC") {
            schedule.sweep_every_sec = parse_env("SWEEP_ALL_EVERY_SEC", &v)?;
        }
        if let Some(v) = lookup("CHECK_PING_EVERY") {
            schedule.ping_every_sec = parse_env("CHECK_PING_EVERY", &v)?;
        }
        if let Some(v) = lookup("EVENT_RECONNECT_BASE_SEC") {
            schedule.reconnect_base_sec = parse_env("EVENT_RECONNECT_BASE_SEC", &v)?;
        }
        if let Some(v) = lookup("EVENT_RECONNECT_MAX_SEC") {
            schedule.reconnect_max_sec = parse_env("EVENT_RECONNECT_MAX_SEC", &v)?;
        }

        if let Some(v) = lookup("WATCHER_HOSTNAME").and_then(non_empty) {
            self.hostname = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smtp.to.is_empty() {
            return Err(ConfigError::Invalid("at least one SMTP recipient is required".into()));
        }
        if !self.smtp.timeout_sec.is_finite() || self.smtp.timeout_sec <= 0.0 {
            return Err(ConfigError::Invalid("SMTP timeout must be positive".into()));
        }
        if let Err(e) = Duration::try_from_secs_f64(self.smtp.timeout_sec) {
            return Err(ConfigError::Invalid(format!(
                "SMTP timeout {} is out of range: {e}",
                self.smtp.timeout_sec
            )));
        }
        if self.schedule.sweep_every_sec == 0
            || self.schedule.ping_every_sec == 0
            || self.schedule.reconnect_base_sec == 0
        {
            return Err(ConfigError::Invalid(
                "sweep, ping and reconnect cadences must be positive".into(),
            ));
        }
        if self.schedule.reconnect_max_sec < self.schedule.reconnect_base_sec {
            return Err(ConfigError::Invalid(
                "EVENT_RECONNECT_MAX_SEC must not be smaller than EVENT_RECONNECT_BASE_SEC".into(),
            ));
        }
        if self.throttle.backoff_max_sec < self.throttle.backoff_base_sec {
            return Err(ConfigError::Invalid(
                "BACKOFF_MAX_SEC must not be smaller than BACKOFF_BASE_SEC".into(),
            ));
        }
        if self.throttle.restarts_in_window == 0 {
            return Err(ConfigError::Invalid("RESTARTS_IN_WINDOW must be positive".into()));
        }
        if self.throttle.cap_strategy == CapStrategyKind::RollingWindow
            && self.throttle.max_notifies_in_window == 0
        {
            return Err(ConfigError::Invalid("MAX_NOTIFIES_IN_WINDOW must be positive".into()));
        }
        MessageFormatter::new(self.templates.clone(), "localhost".into())?.validate()?;
        Ok(())
    }

    /// The configured host name, or the system hostname.
    pub fn resolved_hostname(&self) -> String {
        if let Some(hostname) = &self.hostname {
            return hostname.clone();
        }
        match nix::unistd::gethostname() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                log::warn!("Unable to read hostname: {e}");
                "localhost".to_string()
            }
        }
    }

    /// Same configuration with secrets masked, suitable for printing.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.smtp.pass.is_some() {
            config.smtp.pass = Some("********".into());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WatcherConfig::default();
        assert_eq!(config.smtp.host, "mail");
        assert_eq!(config.smtp.port, 25);
        assert_eq!(config.smtp.to, vec!["root@localhost".to_string()]);
        assert_eq!(config.throttle.down_grace_sec, 60);
        assert_eq!(config.throttle.max_notifies_in_window, 3);
        assert_eq!(config.throttle.recovery_quiet_sec, 600);
        assert_eq!(config.schedule.sweep_every_sec, 10);
        assert_eq!(config.schedule.ping_every_sec, 60);
        assert!(config.throttle.include_recovery);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_config_file_parsing() {
        let input = r#"
            hostname = "node-1"

            [smtp]
            host = "smtp.example.com"
            port = 587
            to = ["ops@example.com"]
            tls = "starttls"

            [throttle]
            down_grace_sec = 120
            cap_strategy = "per-episode"
            max_loop_alerts = 2

            [templates]
            down_subject = "${ name } is down"
        "#;
        let config = WatcherConfig::try_init_from_string(input).expect("Failed to parse config");
        assert_eq!(config.hostname.as_deref(), Some("node-1"));
        assert_eq!(config.smtp.host, "smtp.example.com");
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.smtp.tls, TlsMode::StartTls);
        assert_eq!(config.smtp.from, "docker-watcher@localhost");
        assert_eq!(config.throttle.down_grace_sec, 120);
        assert_eq!(config.throttle.down_recheck_sec, 60);
        assert_eq!(config.throttle.cap_strategy, CapStrategyKind::PerEpisode);
        assert_eq!(config.throttle.max_loop_alerts, 2);
        assert_eq!(config.templates.down_subject, "${ name } is down");
        assert_eq!(
            config.templates.up_subject,
            MessageTemplates::default().up_subject
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = WatcherConfig::default();
        config
            .apply_env(env(&[
                ("SMTP_HOST", "relay"),
                ("SMTP_PORT", "2525"),
                ("SMTP_TO", "a@example.com, b@example.com,,"),
                ("SMTP_TLS", "yes"),
                ("SMTP_USER", "watcher"),
                ("SMTP_PASS", ""),
                ("DOWN_GRACE_SEC", "30"),
                ("INCLUDE_RECOVERY", "0"),
                ("CAP_STRATEGY", "per-episode"),
                ("SWEEP_ALL_EVERY_SEC", "5"),
                ("WATCHER_HOSTNAME", "edge-7"),
            ]))
            .expect("valid environment");

        assert_eq!(config.smtp.host, "relay");
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.smtp.to, vec!["a@example.com", "b@example.com"]);
        assert_eq!(config.smtp.tls, TlsMode::StartTls);
        assert_eq!(config.smtp.user.as_deref(), Some("watcher"));
        assert_eq!(config.smtp.pass, None);
        assert_eq!(config.throttle.down_grace_sec, 30);
        assert!(!config.throttle.include_recovery);
        assert_eq!(config.throttle.cap_strategy, CapStrategyKind::PerEpisode);
        assert_eq!(config.schedule.sweep_every_sec, 5);
        assert_eq!(config.resolved_hostname(), "edge-7");
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = WatcherConfig::default();
        let res = config.apply_env(env(&[("SMTP_PORT", "twenty-five")]));
        assert!(
            matches!(res, Err(ConfigError::InvalidEnv { key: "SMTP_PORT", .. })),
            "{:?}",
            res
        );
    }

    #[test]
    fn test_huge_smtp_timeout_is_rejected() {
        let mut config = WatcherConfig::default();
        config
            .apply_env(env(&[("SMTP_TIMEOUT", "1e30")]))
            .expect("parses as a float");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.smtp.timeout_sec = 30.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_modes() {
        let cases = vec![
            ("0", TlsMode::None),
            ("off", TlsMode::None),
            ("1", TlsMode::StartTls),
            ("ON", TlsMode::StartTls),
            ("starttls", TlsMode::StartTls),
            ("implicit", TlsMode::Implicit),
            ("wrapper", TlsMode::Implicit),
        ];
        for (raw, expected) in cases {
            assert_eq!(TlsMode::from_env(raw), expected, "{raw}");
        }
    }

    #[test]
    fn test_validation_errors() {
        let mut config = WatcherConfig::default();
        config.smtp.to.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = WatcherConfig::default();
        config.throttle.backoff_max_sec = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = WatcherConfig::default();
        config.schedule.sweep_every_sec = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = WatcherConfig::default();
        config.templates.loop_body = "${ name } looped ${ times }".into();
        assert!(matches!(config.validate(), Err(ConfigError::Template(_))));

        assert!(WatcherConfig::default().validate().is_ok());
    }

    #[test]
    fn test_redacted_hides_password() {
        let mut config = WatcherConfig::default();
        config.smtp.pass = Some("hunter2".into());
        let printed = toml::to_string(&config.redacted()).expect("serializable");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("********"));
    }
}
