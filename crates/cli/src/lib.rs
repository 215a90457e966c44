//! Operator CLI for warden.
//!
//! Every command except `doctor` prints one JSON payload with `command`, `status`,
//! `error_class` and `message` (plus `data` where there is something to report).
//!
//! Exit codes: 0 ok, 1 doctor check failed, 2 config validation, 3 runtime init,
//! 4 database connectivity, 5 migration, 6 storage, 7 calibration below threshold,
//! 8 invalid argument.

pub mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::Level;
use warden_core::config::{AppConfig, LoadOptions, LogFormat};

#[derive(Debug, Parser)]
#[command(
    name = "warden",
    about = "Warden agent governance CLI",
    long_about = "Operate warden migrations, config inspection, judge calibration, batch evaluation and review queue statistics.",
    after_help = "Examples:\n  warden doctor --json\n  warden calibrate --min-pass-rate 0.8\n  warden evaluate --tenant acme --limit 100\n  warden queue-stats --tenant acme"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, field encryption and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Grade the golden conversation set with the configured judge")]
    Calibrate {
        #[arg(long, help = "Minimum share of golden conversations that must pass (0.0-1.0)")]
        min_pass_rate: Option<f64>,
    },
    #[command(about = "Evaluate finished, unevaluated conversations for one tenant")]
    Evaluate {
        #[arg(long, help = "Tenant whose traces are evaluated")]
        tenant: String,
        #[arg(long, default_value_t = 50, help = "Maximum number of traces to evaluate")]
        limit: u32,
        #[arg(long, help = "Evaluate every trace instead of the configured sample")]
        all: bool,
    },
    #[command(about = "Show review queue statistics for one tenant")]
    QueueStats {
        #[arg(long, help = "Tenant whose review queue is summarised")]
        tenant: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Calibrate { min_pass_rate } => commands::calibrate::run(min_pass_rate),
        Command::Evaluate { tenant, limit, all } => commands::evaluate::run(&tenant, limit, all),
        Command::QueueStats { tenant } => commands::queue_stats::run(&tenant),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr so stdout stays a single JSON payload.
fn init_logging() {
    let (level, format) = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => (config.logging.level, config.logging.format),
        Err(_) => ("warn".to_string(), LogFormat::Compact),
    };
    let log_level = level.parse::<Level>().unwrap_or(Level::INFO);

    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);
    let _ = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
