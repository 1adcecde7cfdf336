//! Hearing-impaired annotation removal for SubRip documents

use crate::srt::{self, Cue};
use regex::{Captures, Regex};
use std::sync::LazyLock;

static ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)").unwrap());
static SPEAKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*-?[ \t]*)[A-Z](?:[A-Z0-9 .'\-]*[A-Z0-9])?(:)[ \t]*").unwrap()
});
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());

const MUSIC_NOTES: [char; 2] = ['♪', '♫'];

/// Result of cleaning one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cleaned {
    pub content: String,
    pub changed: bool,
    pub removed_cues: usize,
}

fn is_residue(line: &str) -> bool {
    line.chars().all(|c| c.is_whitespace() || c == '-' || c == ':')
}

/// Drop `NAME:` labels at line starts; a colon followed by a digit is a clock time
fn strip_speakers(text: &str) -> String {
    SPEAKER
        .replace_all(text, |caps: &Captures| {
            let colon_end = caps.get(2).map_or(text.len(), |m| m.end());
            if text[colon_end..].starts_with(|c: char| c.is_ascii_digit()) {
                caps[0].to_string()
            } else {
                caps[1].to_string()
            }
        })
        .into_owned()
}

fn clean_cue(cue: &Cue, remove_music: bool) -> Vec<String> {
    let joined = cue.lines.join("\n");
    let stripped = ANNOTATION.replace_all(&joined, "");
    let stripped = strip_speakers(&stripped);

    let mut lines: Vec<String> = stripped
        .lines()
        .filter(|line| !(remove_music && line.contains(MUSIC_NOTES)))
        .map(|line| SPACES.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !is_residue(line))
        .collect();

    // A lone remaining dialogue dash has no partner line
    if lines.len() == 1 {
        if let Some(rest) = lines[0].strip_prefix('-') {
            lines[0] = rest.trim_start().to_string();
        }
    }
    lines
}

/// Strip SDH annotations, speaker labels and (optionally) music cues.
///
/// Documents without anything to strip come back byte-identical with
/// `changed == false`.
pub fn clean(content: &str, remove_music: bool) -> Cleaned {
    let cues = srt::parse(content);
    let mut removed_cues = 0;
    let mut changed = false;
    let cleaned: Vec<Cue> = cues
        .iter()
        .filter_map(|cue| {
            let lines = clean_cue(cue, remove_music);
            let original: Vec<&str> = cue.lines.iter().map(|l| l.trim()).collect();
            if lines.iter().map(String::as_str).ne(original.iter().copied()) {
                changed = true;
            }
            if lines.is_empty() {
                removed_cues += 1;
                None
            } else {
                Some(Cue {
                    start_ms: cue.start_ms,
                    end_ms: cue.end_ms,
                    lines,
                })
            }
        })
        .collect();

    if changed {
        Cleaned {
            content: srt::write(&cleaned),
            changed,
            removed_cues,
        }
    } else {
        Cleaned {
            content: content.to_string(),
            changed,
            removed_cues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(cues: &[&str]) -> String {
        cues.iter()
            .enumerate()
            .map(|(i, text)| {
                format!("{}\n00:00:0{},000 --> 00:00:0{},500\n{}\n\n", i + 1, i, i, text)
            })
            .collect()
    }

    #[test]
    fn test_removes_annotations_and_speakers() {
        let input = doc(&["[door slams]\nJOHN: Who's there?", "- (whispers) Run.\n- MARY: Where?"]);
        let cleaned = clean(&input, true);
        assert!(cleaned.changed);
        let cues = srt::parse(&cleaned.content);
        assert_eq!(cues[0].lines, vec!["Who's there?"]);
        assert_eq!(cues[1].lines, vec!["- Run.", "- Where?"]);
    }

    #[test]
    fn test_drops_cues_left_empty() {
        let input = doc(&["[thunder rumbling]", "Hello."]);
        let cleaned = clean(&input, true);
        assert_eq!(cleaned.removed_cues, 1);
        let cues = srt::parse(&cleaned.content);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].lines, vec!["Hello."]);
    }

    #[test]
    fn test_music_removal_is_optional() {
        let input = doc(&["♪ La la la ♪"]);
        assert_eq!(srt::parse(&clean(&input, true).content).len(), 0);
        let kept = clean(&input, false);
        assert!(!kept.changed);
        assert_eq!(kept.content, input);
    }

    #[test]
    fn test_lone_dash_is_dropped() {
        let input = doc(&["- [gasps]\n- What?"]);
        let cues = srt::parse(&clean(&input, true).content);
        assert_eq!(cues[0].lines, vec!["What?"]);
    }

    #[test]
    fn test_clean_is_idempotent() {
        let input = doc(&["[laughs] NARRATOR: Once upon a time.", "Plain line."]);
        let once = clean(&input, true);
        let twice = clean(&once.content, true);
        assert!(once.changed);
        assert!(!twice.changed);
        assert_eq!(twice.content, once.content);
    }

    #[test]
    fn test_shouted_times_are_dialogue() {
        let input = doc(&["MEET AT 10:30 SHARP.", "NOON:30 MINUTES LEFT"]);
        let cleaned = clean(&input, true);
        assert!(!cleaned.changed);
        assert_eq!(cleaned.content, input);
    }

    #[test]
    fn test_numbered_speaker_labels() {
        let input = doc(&["GUARD 2: Halt!
DR. JONES:Stay back."]);
        let cues = srt::parse(&clean(&input, true).content);
        assert_eq!(cues[0].lines, vec!["Halt!", "Stay back."]);
    }

    #[test]
    fn test_untouched_document_is_unchanged() {
        let input = doc(&["Nothing to strip here.", "Time is 10:30."]);
        let cleaned = clean(&input, true);
        assert!(!cleaned.changed);
        assert_eq!(cleaned.content, input);
    }
}
