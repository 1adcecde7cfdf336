//! Stage sequencer
//!
//! Drives one file through
//! `Classify → StripTracks → ExtractForConversion → ConvertFormat → SDHClean → Resync → Repack → Finalize`.
//!
//! Every stage that rewrites the container is followed by a fresh probe and
//! classification, so later stages never act on a stale plan. Intermediate
//! files live in a per-file work directory that is removed when the file is
//! done, whatever the outcome.

use crate::classify::{classify, main_audio_language};
use crate::config::{Config, ForcedPriority, ToolsConfig};
use crate::display::DisplayAllocator;
use crate::governor::{current_budget, WorkerBudget};
use crate::ocr_fix;
use crate::plan::{strip_original_label, FilePlan, TrackRef};
use crate::pool::{run_pool, PoolError};
use crate::prefs::{CodecPreference, Preferences};
use crate::replace::{replace_source, ReplaceError};
use crate::scan::{categorize, MediaCategory};
use crate::sdh;
use crate::srt;
use crate::staged::StagedName;
use crate::tools::ffmpeg::{self, Encoder};
use crate::tools::mkvmerge::{self, LayoutItem, ProbeError, RepackError};
use crate::tools::ocr::Ocr;
use crate::tools::resync::{self, RetryExhausted};
use crate::tools::{fetch, mkvextract, ToolError};
use crate::track::{SubtitleFormat, Track, TrackKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    StripTracks,
    ExtractForConversion,
    ConvertFormat,
    SdhClean,
    Resync,
    Repack,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Classify,
        Stage::StripTracks,
        Stage::ExtractForConversion,
        Stage::ConvertFormat,
        Stage::SdhClean,
        Stage::Resync,
        Stage::Repack,
        Stage::Finalize,
    ];

    /// Convert stage to string for logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classify => "classify",
            Stage::StripTracks => "strip_tracks",
            Stage::ExtractForConversion => "extract_for_conversion",
            Stage::ConvertFormat => "convert_format",
            Stage::SdhClean => "sdh_clean",
            Stage::Resync => "resync",
            Stage::Repack => "repack",
            Stage::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one per-track task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Task produced this file
    Ok(PathBuf),
    /// Task did not apply; the track is left as it was
    Skipped(String),
    /// Task failed; the track is left as it was and the failure is reported
    Failed(String),
}

/// Error type for processing one file
#[derive(Debug, Error)]
pub enum PipelineError {
    /// mkvmerge could not rewrite the container
    #[error("{path} could not be remuxed during {stage}: {source}")]
    CorruptedFile {
        path: PathBuf,
        stage: Stage,
        #[source]
        source: ToolError,
    },

    #[error("Resync of {subtitle} for {path} gave up: {source}")]
    ResyncExhausted {
        path: PathBuf,
        subtitle: PathBuf,
        #[source]
        source: RetryExhausted<ToolError>,
    },

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("{stage} failed for {path}: {source}")]
    Tool {
        path: PathBuf,
        stage: Stage,
        #[source]
        source: ToolError,
    },

    #[error("Repack failed: {0}")]
    Repack(#[from] RepackError),

    #[error("{stage}: I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Blocking task did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Finalize failed: {0}")]
    Replace(#[from] ReplaceError),
}

impl PipelineError {
    /// Errors that end this file only; anything else ends the run
    pub fn is_fatal_per_file(&self) -> bool {
        matches!(
            self,
            PipelineError::CorruptedFile { .. }
                | PipelineError::ResyncExhausted { .. }
                | PipelineError::Probe(_)
        )
    }
}

/// A track that could not be converted or downloaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackFailure {
    pub kind: TrackKind,
    pub language: String,
    pub reason: String,
}

/// What happened to one file
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub category: MediaCategory,
    /// Stages that ran, in order
    pub stages: Vec<Stage>,
    /// The source was replaced
    pub changed: bool,
    /// Tracks of the file as it is now
    pub final_layout: Vec<Track>,
    pub warnings: Vec<String>,
    /// OCR replacement rule -> hits
    pub ocr_fixes: BTreeMap<String, usize>,
    pub failed_conversions: Vec<TrackFailure>,
    pub failed_downloads: Vec<TrackFailure>,
    pub sdh_cleaned: usize,
    pub resynced: usize,
    pub backup: Option<PathBuf>,
}

impl FileReport {
    fn new(path: &Path, category: MediaCategory) -> Self {
        Self {
            path: path.to_path_buf(),
            category,
            stages: Vec::new(),
            changed: false,
            final_layout: Vec::new(),
            warnings: Vec::new(),
            ocr_fixes: BTreeMap::new(),
            failed_conversions: Vec::new(),
            failed_downloads: Vec::new(),
            sdh_cleaned: 0,
            resynced: 0,
            backup: None,
        }
    }

    fn enter(&mut self, stage: Stage) {
        tracing::info!(file = %self.path.display(), %stage, "Stage started");
        self.stages.push(stage);
    }

    fn skip(&self, stage: Stage, reason: &str) {
        tracing::debug!(file = %self.path.display(), %stage, reason, "Stage skipped");
    }

    fn warn(&mut self, message: String) {
        tracing::warn!(file = %self.path.display(), "{}", message);
        self.warnings.push(message);
    }
}

/// Dry-run view of one file
#[derive(Debug, Clone, Serialize)]
pub struct PlannedFile {
    pub path: PathBuf,
    pub category: MediaCategory,
    pub plan: FilePlan,
}

/// Probe `file` and classify its tracks. Blocking.
pub fn plan_file(
    tools: &ToolsConfig,
    prefs: &Preferences,
    file: &Path,
) -> Result<PlannedFile, ProbeError> {
    let tracks = mkvmerge::probe(tools, file)?;
    Ok(PlannedFile {
        path: file.to_path_buf(),
        category: categorize(file),
        plan: classify(&tracks, prefs),
    })
}

/// Why a track is pulled out of the container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Convert,
    /// Unconverted copy kept next to the converted track
    OriginalCopy,
    /// SubRip track checked for SDH annotations
    SdhSource,
}

#[derive(Debug, Clone, PartialEq)]
struct Extracted {
    track: TrackRef,
    kind: TrackKind,
    purpose: Purpose,
    staged: StagedName,
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Converted,
    /// Copy of the container track with this id
    OriginalCopy(u32),
    SdhCleaned,
    Fetched,
}

/// A staged file headed for the repack
#[derive(Debug, Clone, PartialEq)]
struct Artifact {
    kind: TrackKind,
    /// Container track this stands in for; `None` adds a track
    replaces: Option<u32>,
    path: PathBuf,
    origin: Origin,
    language: String,
    forced: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Conversion {
    Audio {
        encoder: Encoder,
        channels: Option<u32>,
    },
    /// SSA/ASS to SubRip
    Text,
    /// Image subtitles to SubRip
    Ocr,
}

#[derive(Debug, Clone, PartialEq)]
struct ConvertJob {
    kind: TrackKind,
    language: String,
    replaces: Option<u32>,
    input: PathBuf,
    output: StagedName,
    conversion: Conversion,
    fetched: bool,
}

#[derive(Debug)]
struct Converted {
    job: ConvertJob,
    outcome: TrackOutcome,
    fixes: BTreeMap<String, usize>,
}

/// Runs files through the stages with one configuration
pub struct Sequencer {
    config: Arc<Config>,
    prefs: Arc<Preferences>,
    ocr: Arc<Ocr>,
}

impl Sequencer {
    pub fn new(config: Config) -> Self {
        Self::with_displays(config, DisplayAllocator::global())
    }

    /// Create a sequencer that leases displays from `displays`
    pub fn with_displays(config: Config, displays: Arc<DisplayAllocator>) -> Self {
        let prefs = Preferences::from_config(&config);
        let ocr = Ocr::new(config.tools.clone(), displays);
        Self {
            config: Arc::new(config),
            prefs: Arc::new(prefs),
            ocr: Arc::new(ocr),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn preferences(&self) -> &Preferences {
        &self.prefs
    }

    /// Probe and classify without touching anything
    pub async fn plan(&self, file: &Path) -> Result<PlannedFile, PipelineError> {
        let config = Arc::clone(&self.config);
        let prefs = Arc::clone(&self.prefs);
        let file = file.to_path_buf();
        let planned =
            tokio::task::spawn_blocking(move || plan_file(&config.tools, &prefs, &file)).await??;
        Ok(planned)
    }

    /// Run every applicable stage for `file` and replace it with the result
    pub async fn process(&self, file: &Path) -> Result<FileReport, PipelineError> {
        let mut report = FileReport::new(file, categorize(file));

        report.enter(Stage::Classify);
        let mut tracks = self.probe(file).await?;
        let mut plan = classify(&tracks, &self.prefs);
        tracing::info!(
            file = %file.display(),
            audio = ?plan.audio.kept_ids(),
            subtitles = ?plan.subtitles.kept_ids(),
            missing = %plan.subtitles.missing_display(),
            "Classified"
        );

        let has_work = plan.needs_processing()
            || plan.subtitles.needs_sdh_removal
            || !self.fetch_languages(&plan, report.category).is_empty();
        if !has_work {
            tracing::info!(file = %file.display(), "Nothing to do");
            report.final_layout = tracks;
            return Ok(report);
        }

        let work = self.work_dir()?;
        let base = staged_base(file);
        let mut current = file.to_path_buf();
        let mut produced: Option<PathBuf> = None;

        if plan.needs_processing() {
            report.enter(Stage::StripTracks);
            let stripped = work.path().join(format!("{}.stripped.mkv", base));
            self.strip(&current, &stripped, &tracks, &plan).await?;
            tracks = self.probe(&stripped).await?;
            plan = classify(&tracks, &self.prefs);
            current = stripped.clone();
            produced = Some(stripped);
        } else {
            report.skip(Stage::StripTracks, "every track is kept in order");
        }

        let extracted = extraction_targets(&plan, &base, work.path());
        let fetch_languages = self.fetch_languages(&plan, report.category);
        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut jobs: Vec<ConvertJob> = Vec::new();

        if extracted.is_empty() && fetch_languages.is_empty() {
            report.skip(Stage::ExtractForConversion, "nothing to extract or fetch");
        } else {
            report.enter(Stage::ExtractForConversion);
            self.extract(&current, extracted.clone()).await?;
            for item in &extracted {
                match item.purpose {
                    Purpose::OriginalCopy => artifacts.push(Artifact {
                        kind: item.kind,
                        replaces: None,
                        path: item.path.clone(),
                        origin: Origin::OriginalCopy(item.track.id),
                        language: item.track.language.clone(),
                        forced: item.track.forced,
                    }),
                    Purpose::Convert => match conversion_job(item, &self.prefs) {
                        Ok(job) => jobs.push(job),
                        Err(reason) => report.warn(format!(
                            "{} track {} ({}) left unconverted: {}",
                            item.kind, item.track.id, item.track.language, reason
                        )),
                    },
                    Purpose::SdhSource => {}
                }
            }

            for (language, outcome) in self
                .fetch_missing(file, &fetch_languages, &base, work.path())
                .await?
            {
                match outcome {
                    TrackOutcome::Ok(path) => match fetched_conversion(&path) {
                        Some(None) => artifacts.push(Artifact {
                            kind: TrackKind::Subtitle,
                            replaces: None,
                            path,
                            origin: Origin::Fetched,
                            language,
                            forced: false,
                        }),
                        Some(Some(conversion)) => {
                            if let Ok(staged) = StagedName::from_path(&path) {
                                jobs.push(ConvertJob {
                                    kind: TrackKind::Subtitle,
                                    language,
                                    replaces: None,
                                    input: path,
                                    output: staged.with_ext("srt"),
                                    conversion,
                                    fetched: true,
                                });
                            }
                        }
                        None => report.failed_downloads.push(TrackFailure {
                            kind: TrackKind::Subtitle,
                            language,
                            reason: format!("unsupported subtitle file {}", path.display()),
                        }),
                    },
                    TrackOutcome::Skipped(reason) | TrackOutcome::Failed(reason) => {
                        tracing::warn!(
                            file = %file.display(),
                            %language,
                            %reason,
                            "Subtitle download failed"
                        );
                        report.failed_downloads.push(TrackFailure {
                            kind: TrackKind::Subtitle,
                            language,
                            reason,
                        });
                    }
                }
            }
        }

        if jobs.is_empty() {
            report.skip(Stage::ConvertFormat, "nothing requires conversion");
        } else {
            report.enter(Stage::ConvertFormat);
            for converted in self.convert(jobs, work.path()).await? {
                let job = converted.job;
                for (rule, hits) in converted.fixes {
                    *report.ocr_fixes.entry(rule).or_default() += hits;
                }
                match converted.outcome {
                    TrackOutcome::Ok(path) => artifacts.push(Artifact {
                        kind: job.kind,
                        replaces: job.replaces,
                        path,
                        origin: if job.fetched {
                            Origin::Fetched
                        } else {
                            Origin::Converted
                        },
                        language: job.language,
                        forced: job.output.forced,
                    }),
                    TrackOutcome::Skipped(reason) => report.warn(format!(
                        "{} conversion skipped for {}: {}",
                        job.kind, job.language, reason
                    )),
                    TrackOutcome::Failed(reason) => {
                        tracing::warn!(
                            file = %file.display(),
                            kind = %job.kind,
                            language = %job.language,
                            %reason,
                            "Conversion failed"
                        );
                        report.failed_conversions.push(TrackFailure {
                            kind: job.kind,
                            language: job.language,
                            reason,
                        });
                    }
                }
            }
        }

        let wanted = wanted_subtitle_languages(&plan, &self.prefs);
        let mut candidates: Vec<SdhCandidate> = Vec::new();
        if self.prefs.subtitles.remove_sdh {
            candidates.extend(
                extracted
                    .iter()
                    .filter(|e| e.purpose == Purpose::SdhSource)
                    .map(|e| SdhCandidate {
                        path: e.path.clone(),
                        new_artifact: Some(Artifact {
                            kind: TrackKind::Subtitle,
                            replaces: Some(e.track.id),
                            path: e.path.clone(),
                            origin: Origin::SdhCleaned,
                            language: e.track.language.clone(),
                            forced: e.track.forced,
                        }),
                    }),
            );
            candidates.extend(
                artifacts
                    .iter()
                    .filter(|a| a.kind == TrackKind::Subtitle && is_subrip(&a.path))
                    .filter(|a| wanted.contains(&a.language))
                    .map(|a| SdhCandidate {
                        path: a.path.clone(),
                        new_artifact: None,
                    }),
            );
        }
        if candidates.is_empty() {
            report.skip(Stage::SdhClean, "no SubRip subtitle in a wanted language");
        } else {
            report.enter(Stage::SdhClean);
            let budget = self.budget().await?;
            let remove_music = self.prefs.subtitles.remove_music;
            let tasks: Vec<_> = candidates
                .iter()
                .map(|c| {
                    let path = c.path.clone();
                    move || clean_sdh(&path, remove_music)
                })
                .collect();
            let outcomes = run_pool(budget.max_workers, tasks).await?;
            for (candidate, outcome) in candidates.into_iter().zip(outcomes) {
                match outcome? {
                    TrackOutcome::Ok(_) => {
                        report.sdh_cleaned += 1;
                        artifacts.extend(candidate.new_artifact);
                    }
                    TrackOutcome::Skipped(reason) => {
                        tracing::debug!(
                            path = %candidate.path.display(),
                            %reason,
                            "SDH clean skipped"
                        );
                    }
                    TrackOutcome::Failed(reason) => report.warn(format!(
                        "SDH clean of {} failed: {}",
                        candidate.path.display(),
                        reason
                    )),
                }
            }
        }

        let resync_targets: Vec<PathBuf> = artifacts
            .iter()
            .filter(|a| needs_resync(a, self.prefs.subtitles.resync_converted))
            .map(|a| a.path.clone())
            .collect();
        if resync_targets.is_empty() {
            report.skip(Stage::Resync, "no fetched or converted subtitle to resync");
        } else if self.config.tools.resync_command.is_empty() {
            report.warn(format!(
                "{} subtitle(s) left unsynced: no resync command configured",
                resync_targets.len()
            ));
        } else {
            report.enter(Stage::Resync);
            report.resynced = self.resync(file, &current, resync_targets).await?;
        }

        if artifacts.is_empty() {
            report.skip(Stage::Repack, "no new artifacts");
        } else {
            report.enter(Stage::Repack);
            let forced_priority = self.prefs.subtitles.forced_priority;
            let layout = build_layout(&plan, &artifacts, forced_priority, &wanted);
            let repacked = work.path().join(format!("{}.repacked.mkv", base));
            self.repack(&current, &repacked, &tracks, layout).await?;
            produced = Some(repacked);
        }

        match produced {
            None => {
                report.skip(Stage::Finalize, "container unchanged");
                report.final_layout = tracks;
            }
            Some(result) => {
                report.enter(Stage::Finalize);
                let final_tracks = self.probe(&result).await?;
                if classify(&final_tracks, &self.prefs).needs_processing() {
                    report.warn("result still differs from the preferred layout".to_string());
                }
                let keep_original = self.config.paths.keep_original;
                let source = file.to_path_buf();
                report.backup = tokio::task::spawn_blocking(move || {
                    replace_source(&source, &result, keep_original)
                })
                .await??;
                report.changed = true;
                report.final_layout = final_tracks;
                tracing::info!(
                    file = %file.display(),
                    tracks = report.final_layout.len(),
                    "Replaced with processed file"
                );
            }
        }

        if let Err(e) = work.close() {
            tracing::warn!(error = %e, "Failed to remove work directory");
        }
        Ok(report)
    }

    /// Languages to hand to the fetch collaborator for this file
    fn fetch_languages(&self, plan: &FilePlan, category: MediaCategory) -> Vec<String> {
        if plan.subtitles.missing_languages.is_empty()
            || !category.allows_fetch()
            || !fetch::enabled(&self.config.tools)
        {
            return Vec::new();
        }
        plan.subtitles.missing_languages.clone()
    }

    fn work_dir(&self) -> Result<tempfile::TempDir, PipelineError> {
        let root = &self.config.paths.work_dir;
        std::fs::create_dir_all(root)
            .and_then(|_| tempfile::Builder::new().prefix("mkv-tidy-").tempdir_in(root))
            .map_err(|source| PipelineError::Io {
                path: root.clone(),
                stage: Stage::Classify,
                source,
            })
    }

    /// Pool sizes, read from the system at stage entry
    async fn budget(&self) -> Result<WorkerBudget, PipelineError> {
        let config = Arc::clone(&self.config);
        Ok(tokio::task::spawn_blocking(move || current_budget(&config.resources)).await?)
    }

    async fn probe(&self, path: &Path) -> Result<Vec<Track>, PipelineError> {
        let config = Arc::clone(&self.config);
        let path = path.to_path_buf();
        let tracks =
            tokio::task::spawn_blocking(move || mkvmerge::probe(&config.tools, &path)).await??;
        Ok(tracks)
    }

    async fn strip(
        &self,
        input: &Path,
        output: &Path,
        tracks: &[Track],
        plan: &FilePlan,
    ) -> Result<(), PipelineError> {
        let config = Arc::clone(&self.config);
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        let (tracks, plan) = (tracks.to_vec(), plan.clone());
        let path = input.clone();
        tokio::task::spawn_blocking(move || {
            mkvmerge::strip(&config.tools, &input, &output, &tracks, &plan)
        })
        .await?
        .map_err(|source| container_failure(path, Stage::StripTracks, source))
    }

    async fn extract(&self, input: &Path, items: Vec<Extracted>) -> Result<(), PipelineError> {
        if items.is_empty() {
            return Ok(());
        }
        let config = Arc::clone(&self.config);
        let input = input.to_path_buf();
        tokio::task::spawn_blocking(move || extract_all(&config.tools, &input, &items)).await?
    }

    async fn fetch_missing(
        &self,
        media: &Path,
        languages: &[String],
        base: &str,
        dir: &Path,
    ) -> Result<Vec<(String, TrackOutcome)>, PipelineError> {
        if languages.is_empty() {
            return Ok(Vec::new());
        }
        let budget = self.budget().await?;
        let tasks: Vec<_> = languages
            .iter()
            .map(|language| {
                let config = Arc::clone(&self.config);
                let prefs = Arc::clone(&self.prefs);
                let (media, dir) = (media.to_path_buf(), dir.to_path_buf());
                let (language, base) = (language.clone(), base.to_string());
                move || {
                    let outcome = fetch_one(
                        &config.tools,
                        &prefs.subtitles.extension_priority,
                        &media,
                        &language,
                        &base,
                        &dir,
                    );
                    (language, outcome)
                }
            })
            .collect();
        Ok(run_pool(budget.max_workers, tasks).await?)
    }

    /// Run audio and text conversions, then OCR in its own smaller pool
    async fn convert(
        &self,
        jobs: Vec<ConvertJob>,
        dir: &Path,
    ) -> Result<Vec<Converted>, PipelineError> {
        let (ocr_jobs, other_jobs): (Vec<ConvertJob>, Vec<ConvertJob>) = jobs
            .into_iter()
            .partition(|job| job.conversion == Conversion::Ocr);

        let mut results = Vec::new();
        if !other_jobs.is_empty() {
            let budget = self.budget().await?;
            let tasks = self.conversion_tasks(other_jobs, dir, 0.0);
            results.extend(run_pool(budget.max_workers, tasks).await?);
        }
        if !ocr_jobs.is_empty() {
            let budget = self.budget().await?;
            tracing::info!(
                jobs = ocr_jobs.len(),
                workers = budget.max_ocr_workers,
                memory_per_worker_gb = budget.memory_per_worker_gb,
                "Starting OCR"
            );
            let tasks = self.conversion_tasks(ocr_jobs, dir, budget.memory_per_worker_gb);
            results.extend(run_pool(budget.max_ocr_workers, tasks).await?);
        }
        Ok(results)
    }

    fn conversion_tasks(
        &self,
        jobs: Vec<ConvertJob>,
        dir: &Path,
        memory_budget_gb: f32,
    ) -> Vec<impl FnOnce() -> Converted + Send + 'static> {
        jobs.into_iter()
            .map(|job| {
                let config = Arc::clone(&self.config);
                let ocr = Arc::clone(&self.ocr);
                let dir = dir.to_path_buf();
                move || run_job(job, &config.tools, &ocr, &dir, memory_budget_gb)
            })
            .collect()
    }

    /// Resync every target against `reference`; returns how many were synced
    async fn resync(
        &self,
        file: &Path,
        reference: &Path,
        targets: Vec<PathBuf>,
    ) -> Result<usize, PipelineError> {
        let budget = self.budget().await?;
        let tasks: Vec<_> = targets
            .into_iter()
            .map(|subtitle| {
                let config = Arc::clone(&self.config);
                let reference = reference.to_path_buf();
                move || {
                    let result =
                        resync::resync(&config.tools, &config.resync, &reference, &subtitle);
                    (subtitle, result)
                }
            })
            .collect();

        let mut synced = 0;
        for (subtitle, result) in run_pool(budget.max_workers, tasks).await? {
            match result {
                Ok(()) => synced += 1,
                Err(source) => {
                    return Err(PipelineError::ResyncExhausted {
                        path: file.to_path_buf(),
                        subtitle,
                        source,
                    })
                }
            }
        }
        Ok(synced)
    }

    async fn repack(
        &self,
        source: &Path,
        output: &Path,
        tracks: &[Track],
        layout: Vec<LayoutItem>,
    ) -> Result<(), PipelineError> {
        let config = Arc::clone(&self.config);
        let (source, output) = (source.to_path_buf(), output.to_path_buf());
        let tracks = tracks.to_vec();
        let path = source.clone();
        let result = tokio::task::spawn_blocking(move || {
            mkvmerge::repack(&config.tools, &source, &output, &tracks, &layout)
        })
        .await?;
        match result {
            Ok(()) => Ok(()),
            Err(RepackError::Tool(source)) => Err(container_failure(path, Stage::Repack, source)),
            Err(e) => Err(PipelineError::Repack(e)),
        }
    }
}

/// A failed launch is an environment problem; anything else means the
/// container itself could not be rewritten.
fn container_failure(path: PathBuf, stage: Stage, source: ToolError) -> PipelineError {
    match source {
        ToolError::Launch { .. } => PipelineError::Tool {
            path,
            stage,
            source,
        },
        source => PipelineError::CorruptedFile {
            path,
            stage,
            source,
        },
    }
}

/// Prefix for staged files of `file`
fn staged_base(file: &Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "media".to_string())
}

fn is_subrip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("srt"))
}

/// Subtitle languages the layout is ordered by
fn wanted_subtitle_languages(plan: &FilePlan, prefs: &Preferences) -> Vec<String> {
    if prefs.subtitles.main_audio_language_only {
        main_audio_language(&plan.audio.kept, plan.audio.default_track_id)
            .into_iter()
            .collect()
    } else {
        prefs.subtitles.languages.clone()
    }
}

/// Tracks to pull out of the container, with their staged destinations
fn extraction_targets(plan: &FilePlan, base: &str, dir: &Path) -> Vec<Extracted> {
    let entry = |r: &TrackRef, kind: TrackKind, purpose: Purpose| {
        let ext = r.extract_ext.as_deref().unwrap_or("bin");
        let staged = StagedName::new(
            base,
            r.forced,
            r.name.as_str(),
            Some(r.id),
            r.language.as_str(),
            ext,
        );
        Extracted {
            track: r.clone(),
            kind,
            purpose,
            path: staged.path_in(dir),
            staged,
        }
    };

    let audio = &plan.audio;
    let subs = &plan.subtitles;
    let mut out: Vec<Extracted> = Vec::new();
    out.extend(audio.to_convert.iter().map(|r| entry(r, TrackKind::Audio, Purpose::Convert)));
    out.extend(
        audio
            .to_extract_only
            .iter()
            .filter(|r| r.is_original_variant())
            .map(|r| entry(r, TrackKind::Audio, Purpose::OriginalCopy)),
    );
    out.extend(subs.to_convert.iter().map(|r| entry(r, TrackKind::Subtitle, Purpose::Convert)));
    out.extend(
        subs.to_extract_only
            .iter()
            .map(|r| entry(r, TrackKind::Subtitle, Purpose::SdhSource)),
    );
    out
}

/// Split targets into one mkvextract pass and copies for tracks wanted twice
fn split_extraction(items: &[Extracted]) -> (Vec<(u32, PathBuf)>, Vec<(PathBuf, PathBuf)>) {
    let mut primary: Vec<(u32, PathBuf)> = Vec::new();
    let mut copies: Vec<(PathBuf, PathBuf)> = Vec::new();
    for item in items {
        let id = item.track.id;
        match primary.iter().find(|(pid, _)| *pid == id) {
            Some((_, first)) if *first == item.path => {}
            Some((_, first)) => {
                if !copies.iter().any(|(_, to)| *to == item.path) {
                    copies.push((first.clone(), item.path.clone()));
                }
            }
            None => primary.push((id, item.path.clone())),
        }
    }
    (primary, copies)
}

fn extract_all(
    tools: &ToolsConfig,
    input: &Path,
    items: &[Extracted],
) -> Result<(), PipelineError> {
    let (primary, copies) = split_extraction(items);
    mkvextract::extract(tools, input, &primary).map_err(|source| PipelineError::Tool {
        path: input.to_path_buf(),
        stage: Stage::ExtractForConversion,
        source,
    })?;
    for (from, to) in copies {
        std::fs::copy(&from, &to).map_err(|source| PipelineError::Io {
            path: to.clone(),
            stage: Stage::ExtractForConversion,
            source,
        })?;
    }
    Ok(())
}

/// Conversion for an extracted track, or why there is none
fn conversion_job(item: &Extracted, prefs: &Preferences) -> Result<ConvertJob, String> {
    let (conversion, output) = match item.kind {
        TrackKind::Audio => {
            let (codec, channels) = match prefs.audio.target_codec() {
                Some(CodecPreference::Codec { name, channels }) => (name, *channels),
                _ => return Err("no target audio codec configured".to_string()),
            };
            let encoder = ffmpeg::encoder_for(codec)
                .ok_or_else(|| format!("no encoder for audio codec '{}'", codec))?;
            let output = item
                .staged
                .with_name(&strip_original_label(&item.track.name))
                .with_ext(encoder.ext);
            (Conversion::Audio { encoder, channels }, output)
        }
        _ => {
            let format = SubtitleFormat::from_codec(&item.track.codec);
            let conversion = if format.is_image() {
                Conversion::Ocr
            } else if format == SubtitleFormat::Ssa {
                Conversion::Text
            } else {
                return Err(format!("cannot convert subtitle codec {}", item.track.codec));
            };
            (conversion, item.staged.with_ext("srt"))
        }
    };
    Ok(ConvertJob {
        kind: item.kind,
        language: item.track.language.clone(),
        replaces: Some(item.track.id),
        input: item.path.clone(),
        output,
        conversion,
        fetched: false,
    })
}

/// `Some(None)` for SubRip, `Some(conversion)` for convertible files, `None`
/// for anything else
fn fetched_conversion(path: &Path) -> Option<Option<Conversion>> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "srt" => Some(None),
        "ass" | "ssa" => Some(Some(Conversion::Text)),
        "sup" | "sub" => Some(Some(Conversion::Ocr)),
        _ => None,
    }
}

/// Download one language and move the pick under a staged name
fn fetch_one(
    tools: &ToolsConfig,
    priority: &[String],
    media: &Path,
    language: &str,
    base: &str,
    dir: &Path,
) -> TrackOutcome {
    let out_dir = dir.join(format!("fetch-{}", language));
    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        return TrackOutcome::Failed(format!("cannot create {}: {}", out_dir.display(), e));
    }
    let candidates = match fetch::fetch(tools, media, &out_dir, language) {
        Ok(candidates) => candidates,
        Err(e) => return TrackOutcome::Failed(e.to_string()),
    };
    let Some(chosen) = fetch::pick_by_extension(&candidates, priority) else {
        return TrackOutcome::Failed("no subtitle found".to_string());
    };

    let ext = chosen
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("srt")
        .to_lowercase();
    let target = StagedName::new(base, false, "", None, language, ext.as_str()).path_in(dir);
    if let Err(e) = std::fs::rename(chosen, &target) {
        return TrackOutcome::Failed(format!("cannot stage {}: {}", chosen.display(), e));
    }
    // VobSub images live in the .idx/.sub pair
    if ext == "sub" {
        let _ = std::fs::rename(chosen.with_extension("idx"), target.with_extension("idx"));
    }
    TrackOutcome::Ok(target)
}

fn run_job(
    job: ConvertJob,
    tools: &ToolsConfig,
    ocr: &Ocr,
    dir: &Path,
    memory_budget_gb: f32,
) -> Converted {
    let output = job.output.path_in(dir);
    let mut fixes = BTreeMap::new();
    let outcome = match &job.conversion {
        Conversion::Audio { encoder, channels } => {
            let wav = job.output.with_ext("wav").path_in(dir);
            let result = ffmpeg::decode(tools, &job.input, &wav)
                .and_then(|_| ffmpeg::encode(tools, &wav, encoder, *channels, &output));
            let _ = std::fs::remove_file(&wav);
            match result {
                Ok(()) => TrackOutcome::Ok(output),
                Err(e) => TrackOutcome::Failed(e.to_string()),
            }
        }
        Conversion::Text => match ffmpeg::convert_text_subtitle(tools, &job.input, &output) {
            Ok(()) => TrackOutcome::Ok(output),
            Err(e) => TrackOutcome::Failed(e.to_string()),
        },
        Conversion::Ocr => match ocr.convert(&job.input, dir, &job.language, memory_budget_gb) {
            Ok(written) => {
                let (outcome, counts) = accept_ocr_output(&written, &output, &job.language);
                fixes = counts;
                outcome
            }
            Err(e) => TrackOutcome::Failed(e.to_string()),
        },
    };
    Converted {
        job,
        outcome,
        fixes,
    }
}

/// Validate the OCR tool's output and apply the OCR fix table.
///
/// A file without a single timed cue is a failed conversion even when the
/// tool exited cleanly.
fn accept_ocr_output(
    written: &Path,
    output: &Path,
    language: &str,
) -> (TrackOutcome, BTreeMap<String, usize>) {
    let content = match std::fs::read(written) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            return (
                TrackOutcome::Failed(format!("OCR output {} unreadable: {}", written.display(), e)),
                BTreeMap::new(),
            )
        }
    };
    if !srt::is_valid(&content) {
        let _ = std::fs::remove_file(written);
        return (
            TrackOutcome::Failed("OCR output has no timed cues".to_string()),
            BTreeMap::new(),
        );
    }

    let fixed = ocr_fix::apply(&content, language);
    if let Err(e) = std::fs::write(output, &fixed.content) {
        return (
            TrackOutcome::Failed(format!("cannot write {}: {}", output.display(), e)),
            BTreeMap::new(),
        );
    }
    if written != output {
        let _ = std::fs::remove_file(written);
    }
    (TrackOutcome::Ok(output.to_path_buf()), fixed.counts)
}

struct SdhCandidate {
    path: PathBuf,
    /// Artifact to add when cleaning changed the file
    new_artifact: Option<Artifact>,
}

/// Clean one SubRip file in place.
///
/// `Ok` when annotations were removed, `Skipped` when the file had none, and
/// `Failed` when it holds no timed cue to clean.
fn clean_sdh(path: &Path, remove_music: bool) -> Result<TrackOutcome, PipelineError> {
    let io_error = |source| PipelineError::Io {
        path: path.to_path_buf(),
        stage: Stage::SdhClean,
        source,
    };
    let bytes = std::fs::read(path).map_err(io_error)?;
    let content = String::from_utf8_lossy(&bytes);
    if !srt::is_valid(&content) {
        return Ok(TrackOutcome::Failed("no timed cues".to_string()));
    }
    let cleaned = sdh::clean(&content, remove_music);
    if !cleaned.changed {
        return Ok(TrackOutcome::Skipped("no SDH annotations".to_string()));
    }
    std::fs::write(path, &cleaned.content).map_err(io_error)?;
    tracing::debug!(
        path = %path.display(),
        removed_cues = cleaned.removed_cues,
        "Removed SDH annotations"
    );
    Ok(TrackOutcome::Ok(path.to_path_buf()))
}

/// Fetched subtitles always, converted ones when configured; never forced ones
fn needs_resync(artifact: &Artifact, resync_converted: bool) -> bool {
    artifact.kind == TrackKind::Subtitle
        && !artifact.forced
        && match artifact.origin {
            Origin::Fetched => true,
            Origin::Converted => resync_converted,
            _ => false,
        }
}

fn replacement(artifacts: &[Artifact], kind: TrackKind, id: u32) -> Option<&Artifact> {
    artifacts
        .iter()
        .rev()
        .find(|a| a.kind == kind && a.replaces == Some(id))
}

fn set_default(item: &mut LayoutItem, on: bool) {
    match item {
        LayoutItem::Container { default, .. } | LayoutItem::Artifact { default, .. } => {
            *default = on
        }
    }
}

/// Final audio and subtitle layout for the repack.
///
/// Audio follows the plan with converted files standing in for their source
/// tracks and original copies trailing. Subtitles keep the plan's forced
/// placement; fetched files are slotted into the non-forced run by language
/// preference.
fn build_layout(
    plan: &FilePlan,
    artifacts: &[Artifact],
    forced_priority: ForcedPriority,
    wanted: &[String],
) -> Vec<LayoutItem> {
    let mut layout: Vec<LayoutItem> = Vec::new();

    for r in &plan.audio.kept {
        let default = plan.audio.default_track_id == Some(r.id);
        layout.push(match replacement(artifacts, TrackKind::Audio, r.id) {
            Some(a) => LayoutItem::Artifact {
                path: a.path.clone(),
                kind: TrackKind::Audio,
                default,
            },
            None => LayoutItem::Container {
                id: r.id,
                kind: TrackKind::Audio,
                default,
                forced: r.forced,
            },
        });
    }
    for a in artifacts {
        if let Origin::OriginalCopy(source) = a.origin {
            // Without its converted partner the copy would duplicate the source
            let converted = artifacts
                .iter()
                .any(|c| c.origin == Origin::Converted && c.replaces == Some(source));
            if converted {
                layout.push(LayoutItem::Artifact {
                    path: a.path.clone(),
                    kind: TrackKind::Audio,
                    default: false,
                });
            }
        }
    }

    let mut forced: Vec<(LayoutItem, String)> = Vec::new();
    let mut normal: Vec<(LayoutItem, String)> = Vec::new();
    for r in &plan.subtitles.kept {
        let item = match replacement(artifacts, TrackKind::Subtitle, r.id) {
            Some(a) => LayoutItem::Artifact {
                path: a.path.clone(),
                kind: TrackKind::Subtitle,
                default: false,
            },
            None => LayoutItem::Container {
                id: r.id,
                kind: TrackKind::Subtitle,
                default: false,
                forced: r.forced,
            },
        };
        if r.forced {
            forced.push((item, r.language.clone()));
        } else {
            normal.push((item, r.language.clone()));
        }
    }
    for a in artifacts
        .iter()
        .filter(|a| a.kind == TrackKind::Subtitle && a.replaces.is_none())
    {
        let item = LayoutItem::Artifact {
            path: a.path.clone(),
            kind: TrackKind::Subtitle,
            default: false,
        };
        if a.forced {
            forced.push((item, a.language.clone()));
        } else {
            normal.push((item, a.language.clone()));
        }
    }

    let rank = |language: &str| wanted.iter().position(|w| w == language).unwrap_or(usize::MAX);
    normal.sort_by_key(|(_, language)| rank(language));

    let subtitles: Vec<LayoutItem> = if normal.is_empty() {
        let mut items: Vec<LayoutItem> = forced.into_iter().map(|(item, _)| item).collect();
        if let Some(first) = items.first_mut() {
            set_default(first, true);
        }
        items
    } else {
        let default_index = normal
            .iter()
            .position(|(_, language)| rank(language) != usize::MAX)
            .unwrap_or(0);
        set_default(&mut normal[default_index].0, true);
        let normal = normal.into_iter().map(|(item, _)| item);
        let forced = forced.into_iter().map(|(item, _)| item);
        match forced_priority {
            ForcedPriority::First => forced.chain(normal).collect(),
            ForcedPriority::Last => normal.chain(forced).collect(),
            ForcedPriority::None => normal.collect(),
        }
    };
    layout.extend(subtitles);
    layout
}
