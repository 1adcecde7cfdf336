//! Audio track classifier

use super::order_diverges;
use crate::plan::{is_original_label, label_original, TrackPlan, TrackRef};
use crate::prefs::Preferences;
use crate::track::{Track, TrackKind};
use std::collections::HashSet;

/// Extension mkvextract output gets for an audio codec id
pub fn audio_extension(codec_id: &str) -> &'static str {
    let id = codec_id.to_uppercase();
    match id.as_str() {
        "A_AC3" => "ac3",
        "A_EAC3" => "eac3",
        "A_DTS" => "dts",
        "A_TRUEHD" => "thd",
        "A_FLAC" => "flac",
        "A_OPUS" => "opus",
        "A_VORBIS" => "ogg",
        "A_MPEG/L3" => "mp3",
        _ if id.starts_with("A_AAC") => "aac",
        _ if id.starts_with("A_PCM") => "wav",
        _ => "mka",
    }
}

/// Decide which audio tracks survive, in which order, and which get converted.
///
/// # Arguments
/// * `tracks` - The file's full track list in container order
/// * `prefs` - Run preferences; only the audio section and fallback language are read
///
/// # Returns
/// A plan whose `kept` list is never empty when the file has audio.
pub fn classify_audio(tracks: &[Track], prefs: &Preferences) -> TrackPlan {
    let fallback = prefs.fallback_language.as_str();
    let audio: Vec<&Track> = tracks.iter().filter(|t| t.kind == TrackKind::Audio).collect();
    if audio.is_empty() {
        return TrackPlan::default();
    }

    let rank = |t: &Track| {
        let lang = t.normalized_language(fallback);
        prefs.audio.languages.iter().position(|l| *l == lang)
    };

    let mut candidates: Vec<&Track> = audio.iter().copied().filter(|t| rank(t).is_some()).collect();

    if candidates.is_empty() {
        let usable = |t: &&Track| !(prefs.audio.remove_commentary && t.is_commentary());
        let first = audio
            .iter()
            .copied()
            .filter(usable)
            .find(|t| !is_original_label(&t.name))
            .or_else(|| audio.iter().copied().find(usable))
            .unwrap_or(audio[0]);
        let language = first.normalized_language(fallback);
        candidates.push(first);
        // Original variants made from the fallback track stay with it
        candidates.extend(audio.iter().copied().filter(|t| {
            t.id != first.id
                && is_original_label(&t.name)
                && t.normalized_language(fallback) == language
        }));
    }

    if prefs.audio.remove_commentary {
        let mut removed: Vec<&Track> = Vec::new();
        candidates.retain(|t| {
            if t.is_commentary() {
                removed.push(t);
                false
            } else {
                true
            }
        });
        // A file never loses its last audio track
        if candidates.is_empty() {
            if let Some(last) = removed.pop() {
                candidates.push(last);
            }
        }
    }

    // Original variants trail the converted tracks they back up
    candidates.sort_by_key(|t| (is_original_label(&t.name), rank(t).unwrap_or(usize::MAX)));

    let target = prefs.audio.target_codec();
    let mut originals_unsatisfied = false;

    if let Some(target) = target {
        let satisfied = candidates.iter().any(|t| target.matches(&t.codec));
        let originals: Vec<&Track> = candidates
            .iter()
            .copied()
            .filter(|t| is_original_label(&t.name))
            .collect();
        if !satisfied && !originals.is_empty() {
            // Reconvert from the originals only
            originals_unsatisfied = true;
            candidates = originals;
        }
    }

    let satisfied_langs: HashSet<String> = match target {
        Some(target) => candidates
            .iter()
            .filter(|t| target.matches(&t.codec))
            .map(|t| t.normalized_language(fallback))
            .collect(),
        None => HashSet::new(),
    };

    let mut kept = Vec::with_capacity(candidates.len());
    let mut to_convert = Vec::new();
    for track in &candidates {
        let language = track.normalized_language(fallback);
        let mut r = TrackRef::from_track(track, language.clone());
        r.extract_ext = Some(audio_extension(&track.codec).to_string());
        if let Some(target) = target {
            let keep_as_is = target.matches(&track.codec)
                || (is_original_label(&track.name) && satisfied_langs.contains(&language));
            if !keep_as_is {
                r.needs_convert = true;
                to_convert.push(r.clone());
            }
        }
        kept.push(r);
    }

    let mut to_extract_only = Vec::new();
    if !to_convert.is_empty() {
        to_extract_only.extend(kept.iter().filter(|r| !r.needs_convert).cloned());
        // Commentary is never doubled up
        if prefs.audio.keeps_original() && !audio[0].is_commentary() {
            if let Some(first) = to_convert.iter().find(|r| r.id == audio[0].id) {
                let mut variant = first.clone();
                variant.needs_convert = false;
                variant.name = label_original(&first.name);
                to_extract_only.push(variant);
            }
        }
    }

    let needs_processing = kept.len() < audio.len()
        || !to_convert.is_empty()
        || order_diverges(&kept, &audio)
        || originals_unsatisfied;

    TrackPlan {
        default_track_id: kept.first().map(|r| r.id),
        needs_format_conversion: !to_convert.is_empty(),
        kept,
        to_convert,
        to_extract_only,
        needs_processing,
        needs_sdh_removal: false,
        missing_languages: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::test_support::*;
    use proptest::prelude::*;

    /// Rebuild the container the way strip + convert + repack would
    fn apply(tracks: &[Track], plan: &TrackPlan, target_codec: &str) -> Vec<Track> {
        let mut out: Vec<Track> = tracks
            .iter()
            .filter(|t| t.kind != TrackKind::Audio)
            .cloned()
            .collect();
        for r in &plan.kept {
            let mut t = tracks.iter().find(|t| t.id == r.id).cloned().unwrap();
            if r.needs_convert {
                t.codec = target_codec.to_string();
                t.name = crate::plan::strip_original_label(&t.name);
            }
            out.push(t);
        }
        let next_id = tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        for (i, r) in plan.to_extract_only.iter().filter(|r| r.is_original_variant()).enumerate() {
            let mut t = tracks.iter().find(|t| t.id == r.id).cloned().unwrap();
            t.id = next_id + i as u32;
            t.name = r.name.clone();
            out.push(t);
        }
        out
    }

    #[test]
    fn test_preferred_codec_already_present() {
        let prefs = prefs_with(|cfg| cfg.audio.codecs = "ac3".to_string());
        let tracks = vec![audio(0, "A_AC3", "eng"), audio(1, "A_DTS", "jpn")];
        let plan = classify_audio(&tracks, &prefs);
        assert_eq!(plan.kept_ids(), vec![0]);
        assert!(plan.to_convert.is_empty());
        assert!(plan.needs_processing);

        let stripped = vec![audio(0, "A_AC3", "eng")];
        assert!(!classify_audio(&stripped, &prefs).needs_processing);
    }

    #[test]
    fn test_conversion_and_extract_only_sets() {
        let prefs = prefs_with(|cfg| {
            cfg.audio.languages = vec!["eng".to_string(), "jpn".to_string()];
            cfg.audio.codecs = "ac3:6,orig".to_string();
        });
        let tracks = vec![audio(1, "A_DTS", "eng"), audio(2, "A_AC3", "jpn")];
        let plan = classify_audio(&tracks, &prefs);
        assert_eq!(plan.kept_ids(), vec![1, 2]);
        assert_eq!(plan.to_convert.len(), 1);
        assert_eq!(plan.to_convert[0].id, 1);
        assert_eq!(plan.to_convert[0].extract_ext.as_deref(), Some("dts"));
        let extract_only: Vec<(u32, String)> = plan
            .to_extract_only
            .iter()
            .map(|r| (r.id, r.name.clone()))
            .collect();
        assert_eq!(extract_only, vec![(2, String::new()), (1, "(Original)".to_string())]);
        assert!(plan.needs_format_conversion);
    }

    #[test]
    fn test_orig_only_never_converts() {
        let prefs = prefs_with(|cfg| cfg.audio.codecs = "orig".to_string());
        let tracks = vec![audio(1, "A_DTS", "eng"), audio(2, "A_TRUEHD", "eng")];
        let plan = classify_audio(&tracks, &prefs);
        assert!(plan.to_convert.is_empty());
        assert!(plan.to_extract_only.is_empty());
        assert!(!plan.needs_processing);
    }

    #[test]
    fn test_false_disables_conversion() {
        let prefs = prefs_with(|cfg| cfg.audio.codecs = "false".to_string());
        let tracks = vec![audio(1, "A_DTS", "eng")];
        assert!(!classify_audio(&tracks, &prefs).needs_format_conversion);
    }

    #[test]
    fn test_commentary_removed_unless_last() {
        let prefs = prefs_with(|_| {});
        let tracks = vec![
            audio(1, "A_AC3", "eng"),
            named(audio(2, "A_AC3", "eng"), "Commentary with the director"),
        ];
        assert_eq!(classify_audio(&tracks, &prefs).kept_ids(), vec![1]);

        let only_commentary = vec![
            named(audio(1, "A_AC3", "eng"), "Commentary 1"),
            named(audio(2, "A_AC3", "eng"), "Commentary 2"),
        ];
        let plan = classify_audio(&only_commentary, &prefs);
        assert_eq!(plan.kept_ids(), vec![2]);
    }

    #[test]
    fn test_unmatched_language_falls_back_to_first() {
        let prefs = prefs_with(|_| {});
        let tracks = vec![audio(1, "A_AC3", "jpn"), audio(2, "A_AC3", "fre")];
        let plan = classify_audio(&tracks, &prefs);
        assert_eq!(plan.kept_ids(), vec![1]);
        assert_eq!(plan.default_track_id, Some(1));
    }

    #[test]
    fn test_fallback_track_keeps_its_original_variant() {
        let prefs = prefs_with(|cfg| cfg.audio.codecs = "ac3:6,orig".to_string());
        let tracks = vec![audio(1, "A_EAC3", "jpn")];
        let plan = classify_audio(&tracks, &prefs);
        assert_eq!(plan.to_convert[0].id, 1);
        assert!(plan.to_extract_only.iter().any(|r| r.is_original_variant()));

        let after = apply(&tracks, &plan, "A_AC3");
        let again = classify_audio(&after, &prefs);
        assert_eq!(again.kept_ids(), vec![1, 2]);
        assert!(again.to_convert.is_empty());
        assert!(!again.needs_processing);
    }

    #[test]
    fn test_und_counts_as_fallback_language() {
        let prefs = prefs_with(|_| {});
        let tracks = vec![audio(1, "A_AC3", "jpn"), audio(2, "A_AC3", "und")];
        let plan = classify_audio(&tracks, &prefs);
        assert_eq!(plan.kept_ids(), vec![2]);
        assert_eq!(plan.kept[0].language, "eng");
    }

    #[test]
    fn test_norwegian_variants_share_a_rank() {
        let prefs = prefs_with(|cfg| {
            cfg.audio.languages = vec!["nor".to_string(), "eng".to_string()];
        });
        let tracks = vec![audio(1, "A_AC3", "eng"), audio(2, "A_AC3", "nob")];
        let plan = classify_audio(&tracks, &prefs);
        assert_eq!(plan.kept_ids(), vec![2, 1]);
        assert!(plan.needs_processing);
    }

    #[test]
    fn test_original_variant_narrowing() {
        let prefs = prefs_with(|cfg| cfg.audio.codecs = "eac3,orig".to_string());
        let tracks = vec![
            audio(1, "A_AC3", "eng"),
            named(audio(2, "A_DTS", "eng"), "DTS (Original)"),
        ];
        let plan = classify_audio(&tracks, &prefs);
        assert_eq!(plan.kept_ids(), vec![2]);
        assert_eq!(plan.to_convert[0].id, 2);
        assert!(plan.needs_processing);
    }

    #[test]
    fn test_original_variant_kept_when_satisfied() {
        let prefs = prefs_with(|cfg| cfg.audio.codecs = "ac3,orig".to_string());
        let tracks = vec![
            audio(1, "A_AC3", "eng"),
            named(audio(2, "A_DTS", "eng"), "(Original)"),
        ];
        let plan = classify_audio(&tracks, &prefs);
        assert_eq!(plan.kept_ids(), vec![1, 2]);
        assert!(!plan.needs_processing);
    }

    #[test]
    fn test_no_audio_yields_empty_plan() {
        let prefs = prefs_with(|_| {});
        let plan = classify_audio(&[subtitle(1, "S_TEXT/UTF8", "eng")], &prefs);
        assert_eq!(plan, TrackPlan::default());
    }

    fn codec_setting() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("orig".to_string()),
            Just("false".to_string()),
            Just("ac3".to_string()),
            Just("ac3:6,orig".to_string()),
            Just("eac3,orig".to_string()),
        ]
    }

    fn lang_prefs() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(language(), 1..4)
    }

    // **Feature: mkv-tidy, Property 1: Audio Classifier Totality**
    //
    // *For any* track list, the kept ids SHALL be a duplicate-free subset of the
    // file's audio ids, non-empty whenever the file has audio.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_audio_totality(
            tracks in track_list(),
            langs in lang_prefs(),
            codecs in codec_setting(),
            remove_commentary in proptest::bool::ANY,
        ) {
            let prefs = prefs_with(|cfg| {
                cfg.audio.languages = langs;
                cfg.audio.codecs = codecs;
                cfg.audio.remove_commentary = remove_commentary;
            });
            let plan = classify_audio(&tracks, &prefs);
            let audio_ids: Vec<u32> = tracks
                .iter()
                .filter(|t| t.kind == TrackKind::Audio)
                .map(|t| t.id)
                .collect();
            let kept = plan.kept_ids();
            let unique: HashSet<u32> = kept.iter().copied().collect();

            prop_assert_eq!(unique.len(), kept.len());
            prop_assert!(kept.iter().all(|id| audio_ids.contains(id)));
            prop_assert_eq!(kept.is_empty(), audio_ids.is_empty());
            prop_assert!(plan.to_convert.iter().all(|r| plan.keeps(r.id)));
        }
    }

    // **Feature: mkv-tidy, Property 2: Audio Classifier Idempotence**
    //
    // *For any* track list, applying the plan and classifying again SHALL
    // report that nothing is left to do.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_audio_idempotence(
            tracks in track_list(),
            langs in lang_prefs(),
            codecs in codec_setting(),
            remove_commentary in proptest::bool::ANY,
        ) {
            let prefs = prefs_with(|cfg| {
                cfg.audio.languages = langs;
                cfg.audio.codecs = codecs;
                cfg.audio.remove_commentary = remove_commentary;
            });
            let target_codec = match prefs.audio.target_codec() {
                Some(crate::prefs::CodecPreference::Codec { name, .. }) => {
                    format!("A_{}", name.to_uppercase())
                }
                _ => "A_AC3".to_string(),
            };
            let plan = classify_audio(&tracks, &prefs);
            let after = apply(&tracks, &plan, &target_codec);
            let again = classify_audio(&after, &prefs);

            prop_assert!(
                !again.needs_processing,
                "plan {:?} applied to {:?} gave {:?}",
                plan, after, again
            );
        }
    }

    // **Feature: mkv-tidy, Property 3: Audio Language Order**
    //
    // *For any* two kept tracks whose languages are both preferred, their order
    // in the plan SHALL follow the preference order.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_audio_language_order(
            tracks in track_list(),
            langs in lang_prefs(),
        ) {
            let prefs = prefs_with(|cfg| cfg.audio.languages = langs);
            let plan = classify_audio(&tracks, &prefs);
            let ranks: Vec<usize> = plan
                .kept
                .iter()
                .filter_map(|r| prefs.audio.languages.iter().position(|l| *l == r.language))
                .collect();
            prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "ranks {:?}", ranks);
        }
    }

    // **Feature: mkv-tidy, Property 4: Commentary Floor**
    //
    // *For any* file whose audio tracks are all commentary, with commentary
    // removal enabled, the plan SHALL keep at least one track.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_commentary_floor(
            entries in prop::collection::vec((audio_codec(), language()), 1..5),
            langs in lang_prefs(),
        ) {
            let tracks: Vec<Track> = entries
                .iter()
                .enumerate()
                .map(|(i, (codec, lang))| named(audio(i as u32, codec, lang), "Commentary"))
                .collect();
            let prefs = prefs_with(|cfg| {
                cfg.audio.languages = langs;
                cfg.audio.remove_commentary = true;
            });
            let plan = classify_audio(&tracks, &prefs);
            prop_assert!(!plan.kept.is_empty());
        }
    }
}
