use std::{path::PathBuf, sync::OnceLock};

use clap::{Parser, Subcommand};

/// Watch docker containers and email operators when they go down, restart
/// in a loop, or come back up.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file. A missing file means defaults plus
    /// environment variables.
    #[arg(short, long, default_value = "docker-watcher.toml")]
    pub config: PathBuf,
    /// Path to a dotenv file loaded before reading the environment.
    #[arg(short, long, default_value = ".env")]
    pub env_file: PathBuf,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Watch containers until interrupted (default).
    Run,
    /// Load and validate the configuration, then print it.
    CheckConfig,
    /// Send a single test message through the configured SMTP server.
    TestEmail,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
