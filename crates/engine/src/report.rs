//! Run summary
//!
//! Aggregates per-file reports into the end-of-run summary: files changed,
//! failed and untouched, OCR fixes, and the conversions and downloads that
//! did not work out, by file and language.

use crate::sequencer::{FileReport, PipelineError};
use crate::track::TrackKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// A file that was abandoned
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// A track-level failure, attributed to its file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTrack {
    pub path: PathBuf,
    pub kind: TrackKind,
    pub language: String,
    pub reason: String,
}

/// Everything a run did
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_unix_ms: i64,
    pub finished_unix_ms: i64,
    pub files_scanned: usize,
    pub files_changed: usize,
    pub files_unchanged: usize,
    pub files_failed: usize,
    /// OCR replacement rule -> hits, over all files
    pub ocr_fixes: BTreeMap<String, usize>,
    pub failed_conversions: Vec<FailedTrack>,
    pub failed_downloads: Vec<FailedTrack>,
    pub failures: Vec<FileFailure>,
    pub files: Vec<FileReport>,
    /// Set when the run stopped early
    pub aborted: Option<String>,
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl RunSummary {
    pub fn new(files_scanned: usize) -> Self {
        Self {
            started_unix_ms: now_unix_ms(),
            finished_unix_ms: 0,
            files_scanned,
            files_changed: 0,
            files_unchanged: 0,
            files_failed: 0,
            ocr_fixes: BTreeMap::new(),
            failed_conversions: Vec::new(),
            failed_downloads: Vec::new(),
            failures: Vec::new(),
            files: Vec::new(),
            aborted: None,
        }
    }

    pub fn record(&mut self, report: FileReport) {
        if report.changed {
            self.files_changed += 1;
        } else {
            self.files_unchanged += 1;
        }
        for (rule, hits) in &report.ocr_fixes {
            *self.ocr_fixes.entry(rule.clone()).or_default() += hits;
        }
        let attribute = |failures: &[crate::sequencer::TrackFailure]| {
            failures
                .iter()
                .map(|f| FailedTrack {
                    path: report.path.clone(),
                    kind: f.kind,
                    language: f.language.clone(),
                    reason: f.reason.clone(),
                })
                .collect::<Vec<_>>()
        };
        self.failed_conversions
            .extend(attribute(&report.failed_conversions));
        self.failed_downloads.extend(attribute(&report.failed_downloads));
        self.files.push(report);
    }

    pub fn record_failure(&mut self, path: &Path, error: &PipelineError) {
        self.files_failed += 1;
        self.failures.push(FileFailure {
            path: path.to_path_buf(),
            error: error.to_string(),
        });
    }

    pub fn abort(&mut self, reason: String) {
        self.aborted = Some(reason);
    }

    pub fn finish(&mut self) {
        self.finished_unix_ms = now_unix_ms();
    }

    pub fn total_ocr_fixes(&self) -> usize {
        self.ocr_fixes.values().sum()
    }

    /// Emit the summary through tracing
    pub fn log(&self) {
        tracing::info!(
            scanned = self.files_scanned,
            changed = self.files_changed,
            unchanged = self.files_unchanged,
            failed = self.files_failed,
            ocr_fixes = self.total_ocr_fixes(),
            "Run finished"
        );
        for (rule, hits) in &self.ocr_fixes {
            tracing::info!(rule = %rule, hits, "OCR fix applied");
        }
        for f in &self.failed_conversions {
            tracing::warn!(
                file = %f.path.display(),
                kind = %f.kind,
                language = %f.language,
                reason = %f.reason,
                "Conversion failed"
            );
        }
        for f in &self.failed_downloads {
            tracing::warn!(
                file = %f.path.display(),
                language = %f.language,
                reason = %f.reason,
                "Download failed"
            );
        }
        for f in &self.failures {
            tracing::error!(file = %f.path.display(), error = %f.error, "File failed");
        }
        if let Some(reason) = &self.aborted {
            tracing::error!(%reason, "Run aborted");
        }
    }

    /// Write the summary as pretty JSON
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
