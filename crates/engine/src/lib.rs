//! mkv-tidy
//!
//! Tidies Matroska files in place: keeps the audio and subtitle tracks the
//! configured language and codec preferences ask for, converts what has to
//! be converted, and puts the result back where the source was.

pub mod batch;
pub mod classify;
pub mod display;
pub mod governor;
pub mod gui;
pub mod logging;
pub mod ocr_fix;
pub mod plan;
pub mod pool;
pub mod prefs;
pub mod replace;
pub mod report;
pub mod scan;
pub mod sdh;
pub mod sequencer;
pub mod srt;
pub mod staged;
pub mod startup;
pub mod tools;
pub mod track;

pub use mkv_tidy_config as config;
pub use mkv_tidy_config::Config;
pub use batch::{plan_batch, run_batch, BatchError, BatchOptions, DryRunReport};
pub use classify::classify;
pub use display::{DisplayAllocator, DisplayLease};
pub use governor::{compute_ocr_worker_count, compute_worker_count, WorkerBudget};
pub use plan::{FilePlan, TrackPlan, TrackRef};
pub use prefs::Preferences;
pub use report::RunSummary;
pub use scan::{categorize, scan_libraries, MediaCategory};
pub use sequencer::{
    plan_file, FileReport, PipelineError, PlannedFile, Sequencer, Stage, TrackOutcome,
};
pub use staged::StagedName;
pub use startup::{run_startup_checks, StartupError};
pub use track::{SubtitleFormat, Track, TrackKind};
