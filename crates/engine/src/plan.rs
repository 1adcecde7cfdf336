//! Classifier output types.

use crate::track::Track;
use serde::Serialize;

/// Marker carried in the name of an unconverted audio track kept beside its
/// converted counterpart.
pub const ORIGINAL_MARKER: &str = "(Original)";

/// Reference to one track of the classified file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackRef {
    pub id: u32,
    /// Normalized language
    pub language: String,
    pub name: String,
    pub codec: String,
    pub forced: bool,
    /// Track must be converted before it can be kept
    pub needs_convert: bool,
    /// Extension to extract this track with, when it gets extracted
    pub extract_ext: Option<String>,
}

impl TrackRef {
    pub fn from_track(track: &Track, language: String) -> Self {
        Self {
            id: track.id,
            language,
            name: track.name.clone(),
            codec: track.codec.clone(),
            forced: track.forced,
            needs_convert: false,
            extract_ext: None,
        }
    }

    pub fn is_original_variant(&self) -> bool {
        is_original_label(&self.name)
    }
}

pub fn is_original_label(name: &str) -> bool {
    name.to_ascii_lowercase()
        .contains(&ORIGINAL_MARKER.to_ascii_lowercase())
}

/// Append the original marker to a track name
pub fn label_original(name: &str) -> String {
    if is_original_label(name) {
        name.to_string()
    } else if name.trim().is_empty() {
        ORIGINAL_MARKER.to_string()
    } else {
        format!("{} {}", name.trim(), ORIGINAL_MARKER)
    }
}

/// Name for the converted copy of an original variant
pub fn strip_original_label(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    match lower.find(&ORIGINAL_MARKER.to_ascii_lowercase()) {
        Some(pos) => {
            let mut out = name[..pos].to_string();
            out.push_str(&name[pos + ORIGINAL_MARKER.len()..]);
            out.trim().to_string()
        }
        None => name.to_string(),
    }
}

/// What happens to the audio or subtitle tracks of one file.
///
/// Always computed from the container's current state. A plan taken before a
/// mutating stage is stale afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackPlan {
    /// Tracks in the final layout, in final order
    pub kept: Vec<TrackRef>,
    /// Tracks extracted to be converted
    pub to_convert: Vec<TrackRef>,
    /// Tracks extracted unchanged so the repack can rebuild the layout
    pub to_extract_only: Vec<TrackRef>,
    pub default_track_id: Option<u32>,
    pub needs_processing: bool,
    pub needs_sdh_removal: bool,
    pub needs_format_conversion: bool,
    /// Requested languages with no track in the file
    pub missing_languages: Vec<String>,
}

impl TrackPlan {
    pub fn kept_ids(&self) -> Vec<u32> {
        self.kept.iter().map(|t| t.id).collect()
    }

    pub fn keeps(&self, id: u32) -> bool {
        self.kept.iter().any(|t| t.id == id)
    }

    /// Missing languages for display, `none` when nothing is missing
    pub fn missing_display(&self) -> String {
        if self.missing_languages.is_empty() {
            "none".to_string()
        } else {
            self.missing_languages.join(",")
        }
    }
}

/// Audio and subtitle plans for one file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilePlan {
    pub audio: TrackPlan,
    pub subtitles: TrackPlan,
}

impl FilePlan {
    pub fn needs_processing(&self) -> bool {
        self.audio.needs_processing || self.subtitles.needs_processing
    }
}
