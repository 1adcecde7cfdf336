//! CLI entry point for mkv-tidy
//!
//! Parses arguments, loads the configuration and runs a batch (or a dry run)
//! over the given files and library folders.

use clap::Parser;
use mkv_tidy::config::ConfigError;
use mkv_tidy::logging::init_tracing;
use mkv_tidy::{plan_batch, run_batch, BatchOptions, Config};
use std::path::PathBuf;
use std::process::ExitCode;

/// mkv-tidy - Keep the tracks you want, convert the ones you need
#[derive(Parser, Debug)]
#[command(name = "mkv-tidy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print each file's plan as JSON and change nothing
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Write the run summary as JSON to this file
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Skip the preflight tool checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log filter when RUST_LOG is unset (e.g. "debug", "mkv_tidy=trace")
    #[arg(short, long)]
    log_level: Option<String>,

    /// Files or library folders to process
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let options = BatchOptions {
        skip_checks: args.skip_checks,
        report: args.report,
    };
    if options.skip_checks {
        tracing::warn!("Skipping startup checks (--skip-checks enabled)");
    }

    if args.dry_run {
        return match plan_batch(&config, &args.paths, &options).await {
            Ok(report) => match serde_json::to_string_pretty(&report) {
                Ok(json) => {
                    println!("{}", json);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to serialize dry run: {}", e);
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                eprintln!("Dry run failed: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    match run_batch(config, &args.paths, &options).await {
        Ok(summary) if summary.aborted.is_some() => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
