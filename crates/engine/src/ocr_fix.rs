//! Fixes for common OCR misreads in SubRip output.

use crate::srt::{self, Cue};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Misreads that cannot be real text in any language
const COMMON_RULES: &[(&str, &str)] = &[(r"\|", "I"), (r"''", "\"")];

/// English-only confusions; `l'` is a valid elision in French and Italian
const ENGLISH_RULES: &[(&str, &str)] = &[
    (r"\bl'm\b", "I'm"),
    (r"\bl'll\b", "I'll"),
    (r"\bl've\b", "I've"),
    (r"\bl'd\b", "I'd"),
    (r"\bl\b", "I"),
    (r"\b0f\b", "of"),
    (r"\bvv", "w"),
    (r" +([,.?!])", "$1"),
];

type Rule = (Regex, &'static str, &'static str);

fn compile(rules: &[(&'static str, &'static str)]) -> Vec<Rule> {
    rules
        .iter()
        .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), *pattern, *replacement))
        .collect()
}

static COMMON: LazyLock<Vec<Rule>> = LazyLock::new(|| compile(COMMON_RULES));
static ENGLISH: LazyLock<Vec<Rule>> = LazyLock::new(|| compile(ENGLISH_RULES));

/// Rules for a normalized language code, applied in order
fn rules_for(language: &str) -> impl Iterator<Item = &'static Rule> {
    let english: &'static [Rule] = if language == "eng" { ENGLISH.as_slice() } else { &[] };
    english.iter().chain(COMMON.iter())
}

/// Fixed document and how often each rule fired
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OcrFixes {
    pub content: String,
    pub counts: BTreeMap<String, usize>,
}

fn fix_line(line: &str, language: &str, counts: &mut BTreeMap<String, usize>) -> String {
    let mut text = line.to_string();
    for (re, pattern, replacement) in rules_for(language) {
        let hits = re.find_iter(&text).count();
        if hits > 0 {
            text = re.replace_all(&text, *replacement).into_owned();
            *counts.entry((*pattern).to_string()).or_default() += hits;
        }
    }
    text
}

/// Apply the replacement table for `language` to every cue line
pub fn apply(content: &str, language: &str) -> OcrFixes {
    let mut counts = BTreeMap::new();
    let cues: Vec<Cue> = srt::parse(content)
        .into_iter()
        .map(|cue| Cue {
            lines: cue.lines.iter().map(|l| fix_line(l, language, &mut counts)).collect(),
            ..cue
        })
        .collect();

    if counts.is_empty() {
        OcrFixes {
            content: content.to_string(),
            counts,
        }
    } else {
        OcrFixes {
            content: srt::write(&cues),
            counts,
        }
    }
}
