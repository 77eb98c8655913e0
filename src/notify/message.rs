use chrono::{DateTime, Local, Utc};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};

use super::Notification;

/// Subject and body templates for every message the watcher sends.
///
/// Templates use `${ var }` delimiters. Available variables: `name`, `time`,
/// `host`, and additionally `count`/`window` for loop alerts and `state` for
/// daemon alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageTemplates {
    pub down_subject: String,
    pub down_body: String,
    pub loop_subject: String,
    pub loop_body: String,
    pub up_subject: String,
    pub up_body: String,
    pub daemon_subject: String,
    pub daemon_body: String,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            down_subject: "${ name } container is down at ${ time }".into(),
            down_body: "${ name } container is down at ${ time } on ${ host }.".into(),
            loop_subject:
                "${ name } is restarting frequently (${ count } times ~${ window }s) at ${ time }"
                    .into(),
            loop_body: "${ name } is restarting frequently (${ count } restarts within \
                        ~${ window }s) at ${ time } on ${ host }.\n\
                        Further loop alerts are suppressed until the container comes back up."
                .into(),
            up_subject: "${ name } container is back up at ${ time }".into(),
            up_body: "${ name } container is back up at ${ time } on ${ host }.".into(),
            daemon_subject: "Docker daemon is ${ state } at ${ time }".into(),
            daemon_body: "Docker daemon is ${ state } on ${ host } at ${ time }.".into(),
        }
    }
}

const TEST_SUBJECT: &str = "docker-watcher test message from ${ host }";
const TEST_BODY: &str = "This is a test message sent by docker-watcher on ${ host } at ${ time }.";

/// Render a timestamp in the local timezone (honours `TZ`).
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S %Z")
        .to_string()
}

/// Strip the leading slash docker puts in front of container names.
pub fn display_name(raw: &str) -> &str {
    raw.trim_start_matches('/')
}

pub struct MessageFormatter {
    env: Environment<'static>,
    templates: MessageTemplates,
    host: String,
}

impl std::fmt::Debug for MessageFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFormatter")
            .field("templates", &self.templates)
            .field("host", &self.host)
            .finish()
    }
}

impl MessageFormatter {
    pub fn new(templates: MessageTemplates, host: String) -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        let syntax = minijinja::syntax::SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .build()?;
        env.set_syntax(syntax);
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        Ok(Self {
            env,
            templates,
            host,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Render every template once with sample values so that typos surface
    /// at startup rather than on the first alert.
    pub fn validate(&self) -> Result<(), minijinja::Error> {
        let now = Utc::now();
        self.down("sample", now)?;
        self.looping("sample", 3, 60, now)?;
        self.back_up("sample", now)?;
        self.daemon(true, now)?;
        self.test_message(now)?;
        Ok(())
    }

    fn render(
        &self,
        subject: &str,
        body: &str,
        ctx: minijinja::Value,
    ) -> Result<Notification, minijinja::Error> {
        Ok(Notification {
            subject: self.env.render_str(subject, &ctx)?,
            body: self.env.render_str(body, &ctx)?,
        })
    }

    pub fn down(&self, name: &str, at: DateTime<Utc>) -> Result<Notification, minijinja::Error> {
        let ctx = context! { name => name, time => format_timestamp(at), host => &self.host };
        self.render(&self.templates.down_subject, &self.templates.down_body, ctx)
    }

    pub fn looping(
        &self,
        name: &str,
        count: usize,
        window_sec: i64,
        at: DateTime<Utc>,
    ) -> Result<Notification, minijinja::Error> {
        let ctx = context! {
            name => name,
            count => count,
            window => window_sec,
            time => format_timestamp(at),
            host => &self.host,
        };
        self.render(&self.templates.loop_subject, &self.templates.loop_body, ctx)
    }

    pub fn back_up(&self, name: &str, at: DateTime<Utc>) -> Result<Notification, minijinja::Error> {
        let ctx = context! { name => name, time => format_timestamp(at), host => &self.host };
        self.render(&self.templates.up_subject, &self.templates.up_body, ctx)
    }

    pub fn daemon(&self, up: bool, at: DateTime<Utc>) -> Result<Notification, minijinja::Error> {
        let state = if up { "up" } else { "down" };
        let ctx = context! { state => state, time => format_timestamp(at), host => &self.host };
        self.render(
            &self.templates.daemon_subject,
            &self.templates.daemon_body,
            ctx,
        )
    }

    pub fn test_message(&self, at: DateTime<Utc>) -> Result<Notification, minijinja::Error> {
        let ctx = context! { time => format_timestamp(at), host => &self.host };
        self.render(TEST_SUBJECT, TEST_BODY, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatter() -> MessageFormatter {
        MessageFormatter::new(MessageTemplates::default(), "node-1".into()).unwrap()
    }

    #[test]
    fn test_default_templates_render() {
        let formatter = formatter();
        formatter.validate().expect("Default templates must render");

        let now = Utc::now();
        let down = formatter.down("web", now).unwrap();
        assert!(down.subject.starts_with("web container is down at "));
        assert!(down.body.ends_with("on node-1."));

        let looping = formatter.looping("web", 3, 60, now).unwrap();
        assert!(looping.subject.contains("(3 times ~60s)"));
        assert!(looping.body.contains("Further loop alerts are suppressed"));

        let up = formatter.back_up("web", now).unwrap();
        assert!(up.subject.starts_with("web container is back up at "));

        let daemon = formatter.daemon(false, now).unwrap();
        assert!(daemon.subject.starts_with("Docker daemon is down at "));
        assert!(daemon.body.contains("on node-1"));
    }

    #[test]
    fn test_custom_template() {
        let templates = MessageTemplates {
            down_subject: "[${ host }] DOWN ${ name }".into(),
            ..MessageTemplates::default()
        };
        let formatter = MessageFormatter::new(templates, "node-1".into()).unwrap();
        let down = formatter.down("db", Utc::now()).unwrap();
        assert_eq!(down.subject, "[node-1] DOWN db");
    }

    #[test]
    fn test_undefined_variable_fails_validation() {
        let templates = MessageTemplates {
            up_body: "${ nonexistent }".into(),
            ..MessageTemplates::default()
        };
        let formatter = MessageFormatter::new(templates, "node-1".into()).unwrap();
        assert!(formatter.validate().is_err());
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("/web"), "web");
        assert_eq!(display_name("web"), "web");
    }
}
