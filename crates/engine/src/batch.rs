//! Batch driver
//!
//! Startup checks, library scan, then every file through the sequencer one at
//! a time. A fatal-per-file error is recorded and the run moves on; anything
//! else stops the run with the summary marked aborted.

use crate::config::{Config, ConfigError};
use crate::governor::compute_worker_count;
use crate::pool::run_pool;
use crate::prefs::Preferences;
use crate::report::{FileFailure, RunSummary};
use crate::scan::scan_libraries;
use crate::sequencer::{plan_file, PlannedFile, Sequencer};
use crate::startup::{check_mkvmerge, run_startup_checks, StartupError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Error type for batch runs
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Failed to write report {path}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Dry run could not finish: {0}")]
    Plan(String),
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Skip the preflight tool checks
    pub skip_checks: bool,
    /// Write the run summary here as JSON
    pub report: Option<PathBuf>,
}

/// Output of a dry run
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub plans: Vec<PlannedFile>,
    pub failures: Vec<FileFailure>,
}

fn scan(config: &Config, roots: &[PathBuf]) -> Vec<PathBuf> {
    let candidates = scan_libraries(roots, Some(&config.paths.work_dir));
    let total_bytes: u64 = candidates.iter().map(|c| c.size_bytes).sum();
    tracing::info!(files = candidates.len(), total_bytes, "Library scan complete");
    candidates.into_iter().map(|c| c.path).collect()
}

/// Probe and classify every file under `roots` without changing anything
pub async fn plan_batch(
    config: &Config,
    roots: &[PathBuf],
    options: &BatchOptions,
) -> Result<DryRunReport, BatchError> {
    if !options.skip_checks {
        let config = config.clone();
        tokio::task::spawn_blocking(move || check_mkvmerge(&config))
            .await
            .map_err(|e| BatchError::Plan(e.to_string()))??;
    }

    let files = scan(config, roots);
    let tools = Arc::new(config.tools.clone());
    let prefs = Arc::new(Preferences::from_config(config));
    let tasks: Vec<_> = files
        .into_iter()
        .map(|file| {
            let tools = Arc::clone(&tools);
            let prefs = Arc::clone(&prefs);
            move || {
                let result = plan_file(&tools, &prefs, &file);
                (file, result)
            }
        })
        .collect();

    let limit = {
        let resources = config.resources.clone();
        tokio::task::spawn_blocking(move || compute_worker_count(&resources))
            .await
            .map_err(|e| BatchError::Plan(e.to_string()))?
    };
    let results = run_pool(limit, tasks)
        .await
        .map_err(|e| BatchError::Plan(e.to_string()))?;

    let mut report = DryRunReport {
        plans: Vec::new(),
        failures: Vec::new(),
    };
    for (file, result) in results {
        match result {
            Ok(planned) => report.plans.push(planned),
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "Could not plan file");
                report.failures.push(FileFailure {
                    path: file,
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(report)
}

/// Process every file under `roots`
///
/// Files go through one after the other; each stage inside a file fans out
/// over its own pool.
pub async fn run_batch(
    config: Config,
    roots: &[PathBuf],
    options: &BatchOptions,
) -> Result<RunSummary, BatchError> {
    if !options.skip_checks {
        let ocr_needed = !config.subtitles.remove_all;
        let checked = config.clone();
        tokio::task::spawn_blocking(move || run_startup_checks(&checked, ocr_needed))
            .await
            .map_err(|e| BatchError::Plan(e.to_string()))??;
    }

    let files = scan(&config, roots);
    let sequencer = Sequencer::new(config);
    let mut summary = RunSummary::new(files.len());

    for (index, file) in files.iter().enumerate() {
        tracing::info!(
            file = %file.display(),
            position = index + 1,
            total = files.len(),
            "Processing file"
        );
        match sequencer.process(file).await {
            Ok(report) => summary.record(report),
            Err(e) if e.is_fatal_per_file() => {
                tracing::error!(file = %file.display(), error = %e, "Skipping file");
                summary.record_failure(file, &e);
            }
            Err(e) => {
                tracing::error!(file = %file.display(), error = %e, "Stopping run");
                summary.record_failure(file, &e);
                summary.abort(e.to_string());
                break;
            }
        }
    }

    summary.finish();
    summary.log();
    if let Some(path) = &options.report {
        write_report(&summary, path)?;
    }
    Ok(summary)
}

fn write_report(summary: &RunSummary, path: &Path) -> Result<(), BatchError> {
    summary
        .write_json(path)
        .map_err(|source| BatchError::Report {
            path: path.to_path_buf(),
            source,
        })?;
    tracing::info!(path = %path.display(), "Report written");
    Ok(())
}
