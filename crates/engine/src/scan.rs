//! Library discovery and media categorization.
//!
//! Recursively finds Matroska files under the given roots and decides what
//! kind of media each one is, which gates subtitle fetching.

use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Extension handled by the pipeline (case-insensitive)
pub const MEDIA_EXTENSION: &str = "mkv";

/// Folder names that hold bonus material rather than the feature itself
pub const EXTRAS_FOLDERS: &[&str] = &[
    "extras",
    "featurettes",
    "trailers",
    "behind the scenes",
    "deleted scenes",
    "interviews",
    "scenes",
    "shorts",
    "samples",
];

static EPISODE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bS\d{1,2}E\d{1,3}\b").unwrap());
static YEAR_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((19|20)\d{2}\)").unwrap());

/// A discovered media file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCandidate {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// What a file is, judged from its path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
    Movie,
    Episode,
    Extra,
    Uncategorized,
}

impl MediaCategory {
    /// Only catalogued media gets subtitles fetched
    pub fn allows_fetch(&self) -> bool {
        matches!(self, MediaCategory::Movie | MediaCategory::Episode)
    }
}

/// Categorize a media file by its name and directories
pub fn categorize(path: &Path) -> MediaCategory {
    let in_extras = path
        .parent()
        .into_iter()
        .flat_map(|dir| dir.components())
        .filter_map(|c| c.as_os_str().to_str())
        .any(|name| EXTRAS_FOLDERS.contains(&name.to_lowercase().as_str()));
    if in_extras {
        return MediaCategory::Extra;
    }

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if EPISODE_TAG.is_match(file_name) {
        return MediaCategory::Episode;
    }

    let parent_name = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if YEAR_TAG.is_match(parent_name) {
        return MediaCategory::Movie;
    }

    MediaCategory::Uncategorized
}

/// Checks if a file has the media extension (case-insensitive).
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(MEDIA_EXTENSION))
}

/// Scans the given roots for media files.
///
/// Roots may be files or directories. Hidden directories (names starting
/// with `.`) and anything under `exclude` are skipped. Results are sorted by
/// path.
pub fn scan_libraries(roots: &[PathBuf], exclude: Option<&Path>) -> Vec<ScanCandidate> {
    use walkdir::WalkDir;

    let mut candidates = Vec::new();

    for root in roots {
        if !root.exists() {
            tracing::warn!(path = %root.display(), "Scan root does not exist");
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            if entry.file_type().is_dir() && entry.depth() > 0 {
                let hidden = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with('.'));
                if hidden {
                    return false;
                }
                if exclude.is_some_and(|dir| entry.path().starts_with(dir)) {
                    return false;
                }
            }
            true
        });

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || !is_media_file(entry.path()) {
                continue;
            }
            if let Ok(metadata) = entry.metadata() {
                candidates.push(ScanCandidate {
                    path: entry.path().to_path_buf(),
                    size_bytes: metadata.len(),
                });
            }
        }
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates.dedup_by(|a, b| a.path == b.path);
    candidates
}
