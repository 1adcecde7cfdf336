//! Track classification
//!
//! Pure functions from a file's current track list and the run's preferences
//! to a [`FilePlan`]. Nothing here touches the filesystem; the sequencer calls
//! [`classify`] again after every stage that rewrites the container.

pub mod audio;
pub mod subtitle;

use crate::plan::{FilePlan, TrackRef};
use crate::prefs::Preferences;
use crate::track::Track;

pub use audio::classify_audio;
pub use subtitle::classify_subtitles;

/// Classify audio first, then subtitles against the resulting main audio language
pub fn classify(tracks: &[Track], prefs: &Preferences) -> FilePlan {
    let audio = classify_audio(tracks, prefs);
    let main_language = main_audio_language(&audio.kept, audio.default_track_id);
    let subtitles = classify_subtitles(tracks, prefs, main_language.as_deref());
    FilePlan { audio, subtitles }
}

/// Language of the default kept audio track, or of the first kept one
pub(crate) fn main_audio_language(kept: &[TrackRef], default_id: Option<u32>) -> Option<String> {
    default_id
        .and_then(|id| kept.iter().find(|t| t.id == id))
        .or_else(|| kept.first())
        .map(|t| t.language.clone())
}

/// True when the plan's order is not the tracks' container order
pub(crate) fn order_diverges(kept: &[TrackRef], container: &[&Track]) -> bool {
    let positions: Vec<usize> = kept
        .iter()
        .filter_map(|r| container.iter().position(|t| t.id == r.id))
        .collect();
    positions.windows(2).any(|w| w[0] > w[1])
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::Config;
    use crate::prefs::Preferences;
    use crate::track::{Track, TrackKind};
    use proptest::prelude::*;

    pub fn track(id: u32, kind: TrackKind, codec: &str, language: &str) -> Track {
        Track {
            id,
            kind,
            codec: codec.to_string(),
            language: language.to_string(),
            name: String::new(),
            forced: false,
            default: false,
        }
    }

    pub fn audio(id: u32, codec: &str, language: &str) -> Track {
        track(id, TrackKind::Audio, codec, language)
    }

    pub fn subtitle(id: u32, codec: &str, language: &str) -> Track {
        track(id, TrackKind::Subtitle, codec, language)
    }

    pub fn named(mut t: Track, name: &str) -> Track {
        t.name = name.to_string();
        t
    }

    pub fn forced(mut t: Track) -> Track {
        t.forced = true;
        t
    }

    pub fn prefs_with(f: impl FnOnce(&mut Config)) -> Preferences {
        let mut cfg = Config::default();
        f(&mut cfg);
        Preferences::from_config(&cfg)
    }

    pub fn language() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("eng".to_string()),
            Just("nor".to_string()),
            Just("nob".to_string()),
            Just("jpn".to_string()),
            Just("spa".to_string()),
            Just("und".to_string()),
        ]
    }

    pub fn audio_codec() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("A_AC3".to_string()),
            Just("A_EAC3".to_string()),
            Just("A_DTS".to_string()),
            Just("A_TRUEHD".to_string()),
            Just("A_AAC".to_string()),
        ]
    }

    pub fn subtitle_codec() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("S_TEXT/UTF8".to_string()),
            Just("S_TEXT/ASS".to_string()),
            Just("S_HDMV/PGS".to_string()),
            Just("S_VOBSUB".to_string()),
            Just("S_TEXT/WEBVTT".to_string()),
        ]
    }

    /// A file's track list: one video track, then audio, then subtitles
    pub fn track_list() -> impl Strategy<Value = Vec<Track>> {
        let audio = prop::collection::vec(
            (audio_codec(), language(), prop::bool::weighted(0.2)),
            0..6,
        );
        let subs = prop::collection::vec(
            (subtitle_codec(), language(), prop::bool::weighted(0.25)),
            0..6,
        );
        (audio, subs).prop_map(|(audio, subs)| {
            let mut tracks = vec![track(0, TrackKind::Video, "V_MPEG4/ISO/AVC", "und")];
            let mut id = 1;
            for (codec, lang, commentary) in audio {
                let mut t = track(id, TrackKind::Audio, &codec, &lang);
                if commentary {
                    t.name = "Commentary".to_string();
                }
                tracks.push(t);
                id += 1;
            }
            for (codec, lang, is_forced) in subs {
                let mut t = track(id, TrackKind::Subtitle, &codec, &lang);
                t.forced = is_forced;
                tracks.push(t);
                id += 1;
            }
            tracks
        })
    }
}
