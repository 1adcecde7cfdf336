//! Track data model and language normalization.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Language code for unknown tracks, as written by mkvmerge.
pub const UNDETERMINED: &str = "und";

/// Kind of media stream inside a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

impl TrackKind {
    /// Map mkvmerge's `type` field
    pub fn from_mkvmerge(s: &str) -> Option<Self> {
        match s {
            "video" => Some(TrackKind::Video),
            "audio" => Some(TrackKind::Audio),
            "subtitles" => Some(TrackKind::Subtitle),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// One media stream inside a container.
///
/// `id` is unique within a file and the track list keeps the container's
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: u32,
    pub kind: TrackKind,
    /// Matroska codec id, e.g. `A_AC3` or `S_HDMV/PGS`
    pub codec: String,
    pub language: String,
    pub name: String,
    pub forced: bool,
    pub default: bool,
}

impl Track {
    /// Language after normalization against `fallback`
    pub fn normalized_language(&self, fallback: &str) -> String {
        normalize_language(&self.language, fallback)
    }

    pub fn is_commentary(&self) -> bool {
        self.name.to_lowercase().contains("commentary")
    }

    pub fn subtitle_format(&self) -> SubtitleFormat {
        SubtitleFormat::from_codec(&self.codec)
    }
}

/// Subtitle encodings the pipeline distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleFormat {
    SubRip,
    Ssa,
    Pgs,
    VobSub,
    Other,
}

impl SubtitleFormat {
    pub fn from_codec(codec: &str) -> Self {
        let upper = codec.to_uppercase();
        if upper == "S_TEXT/UTF8" || upper == "S_TEXT/ASCII" || upper.contains("SUBRIP") {
            SubtitleFormat::SubRip
        } else if upper == "S_TEXT/ASS" || upper == "S_TEXT/SSA" || upper.contains("SUBSTATION") {
            SubtitleFormat::Ssa
        } else if upper == "S_HDMV/PGS" || upper.contains("PGS") {
            SubtitleFormat::Pgs
        } else if upper == "S_VOBSUB" || upper.contains("VOBSUB") {
            SubtitleFormat::VobSub
        } else {
            SubtitleFormat::Other
        }
    }

    /// File extension mkvextract writes for this format
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            SubtitleFormat::SubRip => Some("srt"),
            SubtitleFormat::Ssa => Some("ass"),
            SubtitleFormat::Pgs => Some("sup"),
            SubtitleFormat::VobSub => Some("sub"),
            SubtitleFormat::Other => None,
        }
    }

    /// Image formats need OCR to become SubRip
    pub fn is_image(&self) -> bool {
        matches!(self, SubtitleFormat::Pgs | SubtitleFormat::VobSub)
    }
}

/// Two-letter codes seen in the wild, mapped to the 639-2/B codes mkvmerge uses.
const TWO_LETTER_CODES: &[(&str, &str)] = &[
    ("en", "eng"),
    ("de", "ger"),
    ("fr", "fre"),
    ("es", "spa"),
    ("it", "ita"),
    ("ja", "jpn"),
    ("ko", "kor"),
    ("zh", "chi"),
    ("sv", "swe"),
    ("da", "dan"),
    ("fi", "fin"),
    ("nl", "dut"),
    ("pt", "por"),
    ("ru", "rus"),
    ("pl", "pol"),
];

/// Terminology codes that have a distinct bibliographic form.
const TERMINOLOGY_CODES: &[(&str, &str)] = &[
    ("deu", "ger"),
    ("fra", "fre"),
    ("zho", "chi"),
    ("nld", "dut"),
];

/// Norwegian written standards all compare equal.
const NORWEGIAN: &[&str] = &["nor", "nob", "nno", "no", "nb", "nn"];

/// Canonical form of a language code.
///
/// Empty and `und` become `fallback`, every Norwegian variant becomes `nor`,
/// common two-letter and terminology codes map to their bibliographic code.
pub fn normalize_language(code: &str, fallback: &str) -> String {
    let lower = code.trim().to_lowercase();
    if lower.is_empty() || lower == UNDETERMINED {
        let fb = fallback.trim().to_lowercase();
        if fb.is_empty() || fb == UNDETERMINED {
            return UNDETERMINED.to_string();
        }
        return normalize_language(&fb, UNDETERMINED);
    }
    if NORWEGIAN.contains(&lower.as_str()) {
        return "nor".to_string();
    }
    if let Some((_, three)) = TWO_LETTER_CODES.iter().find(|(two, _)| *two == lower) {
        return three.to_string();
    }
    if let Some((_, bib)) = TERMINOLOGY_CODES.iter().find(|(term, _)| *term == lower) {
        return bib.to_string();
    }
    lower
}

/// Language equality under normalization
pub fn same_language(a: &str, b: &str, fallback: &str) -> bool {
    normalize_language(a, fallback) == normalize_language(b, fallback)
}
