//! Subtitle track classifier

use super::order_diverges;
use crate::config::ForcedPriority;
use crate::plan::{TrackPlan, TrackRef};
use crate::prefs::Preferences;
use crate::track::{normalize_language, SubtitleFormat, Track, TrackKind};

/// Pick the best track among same-language candidates.
///
/// SubRip wins outright, then SSA/ASS, then PGS. VobSub is only taken when
/// the file carries no PGS track at all.
fn pick<'a>(candidates: &[&'a Track], file_has_pgs: bool) -> Option<&'a Track> {
    let first_of = |format: SubtitleFormat| {
        candidates
            .iter()
            .copied()
            .find(|t| t.subtitle_format() == format)
    };
    first_of(SubtitleFormat::SubRip)
        .or_else(|| first_of(SubtitleFormat::Ssa))
        .or_else(|| first_of(SubtitleFormat::Pgs))
        .or_else(|| {
            if file_has_pgs {
                None
            } else {
                first_of(SubtitleFormat::VobSub)
            }
        })
}

fn to_ref(track: &Track, language: String) -> TrackRef {
    let format = track.subtitle_format();
    let mut r = TrackRef::from_track(track, language);
    r.needs_convert = format != SubtitleFormat::SubRip;
    r.extract_ext = format.extension().map(|e| e.to_string());
    r
}

/// Decide which subtitle tracks survive and which need conversion.
///
/// `main_audio_language` is the language of the file's main kept audio track;
/// it replaces the preference list when subtitles are restricted to it.
pub fn classify_subtitles(
    tracks: &[Track],
    prefs: &Preferences,
    main_audio_language: Option<&str>,
) -> TrackPlan {
    let fallback = prefs.fallback_language.as_str();
    let sp = &prefs.subtitles;
    let subs: Vec<&Track> = tracks
        .iter()
        .filter(|t| t.kind == TrackKind::Subtitle)
        .collect();

    if sp.remove_all {
        return TrackPlan {
            needs_processing: !subs.is_empty(),
            ..TrackPlan::default()
        };
    }

    let wanted: Vec<String> = if sp.main_audio_language_only {
        main_audio_language
            .map(|l| normalize_language(l, fallback))
            .into_iter()
            .collect()
    } else {
        sp.languages.clone()
    };

    let mut present: Vec<String> = Vec::new();
    for t in &subs {
        let lang = t.normalized_language(fallback);
        if !present.contains(&lang) {
            present.push(lang);
        }
    }

    let missing_languages: Vec<String> = wanted
        .iter()
        .filter(|l| !present.contains(l))
        .cloned()
        .collect();

    let mut reference: Vec<String> = wanted
        .iter()
        .filter(|l| present.contains(l))
        .cloned()
        .collect();
    if reference.is_empty() && !sp.main_audio_language_only {
        reference = present.clone();
    }

    let file_has_pgs = subs
        .iter()
        .any(|t| t.subtitle_format() == SubtitleFormat::Pgs);

    let mut normal = Vec::new();
    let mut forced = Vec::new();
    for lang in &reference {
        let of_lang = |want_forced: bool| {
            subs.iter()
                .copied()
                .filter(|t| t.forced == want_forced && t.normalized_language(fallback) == *lang)
                .collect::<Vec<&Track>>()
        };
        if let Some(t) = pick(&of_lang(false), file_has_pgs) {
            normal.push(to_ref(t, lang.clone()));
        }
        if let Some(t) = pick(&of_lang(true), file_has_pgs) {
            forced.push(to_ref(t, lang.clone()));
        }
    }

    let kept: Vec<TrackRef> = if normal.is_empty() {
        forced
    } else {
        match sp.forced_priority {
            ForcedPriority::First => forced.into_iter().chain(normal).collect(),
            ForcedPriority::Last => normal.into_iter().chain(forced).collect(),
            ForcedPriority::None => normal,
        }
    };

    let default_track_id = reference
        .first()
        .and_then(|first| kept.iter().find(|r| !r.forced && r.language == *first))
        .or_else(|| kept.iter().find(|r| !r.forced && wanted.contains(&r.language)))
        .or_else(|| kept.first())
        .map(|r| r.id);

    let to_convert: Vec<TrackRef> = kept.iter().filter(|r| r.needs_convert).cloned().collect();
    let needs_sdh_removal = sp.remove_sdh && kept.iter().any(|r| wanted.contains(&r.language));
    let to_extract_only: Vec<TrackRef> = if needs_sdh_removal {
        kept.iter()
            .filter(|r| !r.needs_convert && wanted.contains(&r.language))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    let needs_format_conversion = !to_convert.is_empty();
    let needs_processing =
        kept.len() < subs.len() || needs_format_conversion || order_diverges(&kept, &subs);

    TrackPlan {
        kept,
        to_convert,
        to_extract_only,
        default_track_id,
        needs_processing,
        needs_sdh_removal,
        needs_format_conversion,
        missing_languages,
    }
}
