use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use cli::Commands;
use config::WatcherConfig;
use engine::{HealthEngine, ThrottlePolicy};
use liveness::LivenessProber;
use notify::{MessageFormatter, Notifier, SmtpNotifier};
use reconcile::Reconciler;
use runtime::{ContainerRuntime, DockerRuntime};
use watcher::Watcher;

mod cli;
mod config;
mod engine;
mod liveness;
mod notify;
mod reconcile;
mod runtime;
mod signals;
mod watcher;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = cli::get_cli_args();

    let config = match WatcherConfig::try_init() {
        Ok(config) => config,
        Err(err) => {
            log::error!("Unable to load configuration from {:?}: {err}", args.config);
            return ExitCode::FAILURE;
        }
    };

    let host = config.resolved_hostname();
    let formatter = match MessageFormatter::new(config.templates.clone(), host.clone()) {
        Ok(formatter) => Arc::new(formatter),
        Err(err) => {
            log::error!("Invalid message templates: {err}");
            return ExitCode::FAILURE;
        }
    };

    match args.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => check_config(&config),
        Commands::TestEmail => test_email(&config, &formatter).await,
        Commands::Run => run(config, formatter).await,
    }
}

fn check_config(config: &WatcherConfig) -> ExitCode {
    match toml::to_string_pretty(&config.redacted()) {
        Ok(rendered) => {
            println!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("Unable to render configuration: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn test_email(config: &WatcherConfig, formatter: &MessageFormatter) -> ExitCode {
    let notifier = match SmtpNotifier::new(&config.smtp) {
        Ok(notifier) => notifier,
        Err(err) => {
            log::error!("Unable to build mail transport: {err}");
            return ExitCode::FAILURE;
        }
    };
    let sent = match formatter.test_message(Utc::now()) {
        Ok(message) => notifier.send(&message).await,
        Err(err) => Err(err.into()),
    };
    match sent {
        Ok(()) => {
            log::info!("Test message sent to {}", config.smtp.to.join(", "));
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("Unable to send test message: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: WatcherConfig, formatter: Arc<MessageFormatter>) -> ExitCode {
    let notifier: Arc<dyn Notifier> = match SmtpNotifier::new(&config.smtp) {
        Ok(notifier) => Arc::new(notifier),
        Err(err) => {
            log::error!("Unable to build mail transport: {err}");
            return ExitCode::FAILURE;
        }
    };

    let runtime: Arc<dyn ContainerRuntime> = match DockerRuntime::connect() {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => {
            log::error!("Unable to connect to docker: {err}");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
    if let Err(err) = signals::handle_shutdown(shutdown_tx) {
        log::error!("Unable to register signal handlers: {err}");
        return ExitCode::FAILURE;
    }

    let policy = ThrottlePolicy::from(&config.throttle);
    log::info!(
        "Starting docker-watcher on {} (SMTP {}:{}, cap strategy {:?})",
        formatter.host(),
        config.smtp.host,
        config.smtp.port,
        policy.cap
    );

    let engine = HealthEngine::new(policy, notifier.clone(), formatter.clone());
    let reconciler = Reconciler::new(runtime.clone(), engine);
    let prober = LivenessProber::new(notifier, formatter);
    let watcher = Watcher::new(runtime, reconciler, prober, &config.schedule);

    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
    watcher.run(shutdown_rx).await;
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);

    ExitCode::SUCCESS
}
