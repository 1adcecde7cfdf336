//! Preference set: the immutable, per-run view of the track selection config.

use crate::config::{Config, ForcedPriority};
use crate::track::normalize_language;
use serde::Serialize;

/// Keep-original sentinel in the codec preference string
pub const KEEP_ORIGINAL: &str = "orig";

/// One entry of the audio codec preference list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CodecPreference {
    /// Convert to this codec, optionally down-mixing to `channels`
    Codec { name: String, channels: Option<u32> },
    /// Keep the unconverted track next to the converted one
    KeepOriginal,
}

impl CodecPreference {
    /// Does a Matroska codec id already satisfy this preference
    pub fn matches(&self, codec_id: &str) -> bool {
        match self {
            CodecPreference::Codec { name, .. } => {
                let id = codec_id.to_uppercase();
                match name.as_str() {
                    "aac" => id.starts_with("A_AAC"),
                    "mp3" => id == "A_MPEG/L3",
                    "pcm" => id.starts_with("A_PCM"),
                    "dts" => id == "A_DTS",
                    other => id == format!("A_{}", other.to_uppercase()),
                }
            }
            CodecPreference::KeepOriginal => false,
        }
    }
}

/// Parse a codec preference string such as `"eac3:6, orig"`.
///
/// `false` (any case) and the empty string disable conversion. Unparseable
/// channel counts are dropped rather than rejected.
pub fn parse_codec_preferences(s: &str) -> Vec<CodecPreference> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false") {
        return Vec::new();
    }
    trimmed
        .split(',')
        .map(|entry| entry.trim().to_lowercase())
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            if entry == KEEP_ORIGINAL {
                return CodecPreference::KeepOriginal;
            }
            match entry.split_once(':') {
                Some((name, channels)) => CodecPreference::Codec {
                    name: name.trim().to_string(),
                    channels: channels.trim().parse().ok(),
                },
                None => CodecPreference::Codec {
                    name: entry,
                    channels: None,
                },
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioPrefs {
    /// Normalized, most wanted first
    pub languages: Vec<String>,
    pub codecs: Vec<CodecPreference>,
    pub remove_commentary: bool,
}

impl AudioPrefs {
    /// First entry when it names a concrete codec
    pub fn target_codec(&self) -> Option<&CodecPreference> {
        match self.codecs.first() {
            Some(pref @ CodecPreference::Codec { .. }) => Some(pref),
            _ => None,
        }
    }

    pub fn keeps_original(&self) -> bool {
        self.codecs.contains(&CodecPreference::KeepOriginal)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtitlePrefs {
    /// Normalized, most wanted first
    pub languages: Vec<String>,
    pub forced_priority: ForcedPriority,
    pub remove_sdh: bool,
    pub remove_music: bool,
    pub main_audio_language_only: bool,
    pub remove_all: bool,
    pub extension_priority: Vec<String>,
    pub resync_converted: bool,
}

/// Everything the classifiers need, fixed for the whole run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preferences {
    pub audio: AudioPrefs,
    pub subtitles: SubtitlePrefs,
    pub fallback_language: String,
}

/// Normalize and de-duplicate, keeping first occurrences
fn normalize_list(langs: &[String], fallback: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for lang in langs {
        let norm = normalize_language(lang, fallback);
        if !out.contains(&norm) {
            out.push(norm);
        }
    }
    out
}

impl Preferences {
    pub fn from_config(cfg: &Config) -> Self {
        let fallback = normalize_language(&cfg.audio.fallback_language, "eng");
        Self {
            audio: AudioPrefs {
                languages: normalize_list(&cfg.audio.languages, &fallback),
                codecs: parse_codec_preferences(&cfg.audio.codecs),
                remove_commentary: cfg.audio.remove_commentary,
            },
            subtitles: SubtitlePrefs {
                languages: normalize_list(&cfg.subtitles.languages, &fallback),
                forced_priority: cfg.subtitles.forced_priority,
                remove_sdh: cfg.subtitles.remove_sdh,
                remove_music: cfg.subtitles.remove_music,
                main_audio_language_only: cfg.subtitles.main_audio_language_only,
                remove_all: cfg.subtitles.remove_all,
                extension_priority: cfg
                    .subtitles
                    .extension_priority
                    .iter()
                    .map(|e| e.trim_start_matches('.').to_lowercase())
                    .collect(),
                resync_converted: cfg.subtitles.resync_converted,
            },
            fallback_language: fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_codec_preferences() {
        assert_eq!(
            parse_codec_preferences("EAC3:6, orig"),
            vec![
                CodecPreference::Codec {
                    name: "eac3".to_string(),
                    channels: Some(6)
                },
                CodecPreference::KeepOriginal,
            ]
        );
        assert!(parse_codec_preferences("false").is_empty());
        assert!(parse_codec_preferences("  ").is_empty());
        assert_eq!(
            parse_codec_preferences("ac3:many"),
            vec![CodecPreference::Codec {
                name: "ac3".to_string(),
                channels: None
            }]
        );
    }

    #[test]
    fn test_codec_matching() {
        let ac3 = CodecPreference::Codec {
            name: "ac3".to_string(),
            channels: None,
        };
        assert!(ac3.matches("A_AC3"));
        assert!(!ac3.matches("A_EAC3"));
        let aac = CodecPreference::Codec {
            name: "aac".to_string(),
            channels: Some(2),
        };
        assert!(aac.matches("A_AAC/MPEG4/LC"));
        assert!(!CodecPreference::KeepOriginal.matches("A_AC3"));
    }

    #[test]
    fn test_from_config_normalizes_languages() {
        let mut cfg = Config::default();
        cfg.audio.languages = vec!["nob".to_string(), "nno".to_string(), "en".to_string()];
        cfg.subtitles.extension_priority = vec![".SRT".to_string()];
        let prefs = Preferences::from_config(&cfg);
        assert_eq!(prefs.audio.languages, vec!["nor".to_string(), "eng".to_string()]);
        assert_eq!(prefs.subtitles.extension_priority, vec!["srt".to_string()]);
        assert_eq!(prefs.fallback_language, "eng");
    }

    #[test]
    fn test_target_codec_requires_leading_codec() {
        let mut cfg = Config::default();
        cfg.audio.codecs = "orig,ac3".to_string();
        let prefs = Preferences::from_config(&cfg);
        assert!(prefs.audio.target_codec().is_none());
        assert!(prefs.audio.keeps_original());
    }
}
