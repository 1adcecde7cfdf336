//! SubRip reading and writing

use regex::Regex;
use std::sync::LazyLock;

static TIMING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{2}):(\d{2}):(\d{2})[,.](\d{3}) --> (\d{2}):(\d{2}):(\d{2})[,.](\d{3})").unwrap()
});

/// One subtitle cue; times in milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub lines: Vec<String>,
}

/// True when the document has at least one well-formed timing line.
///
/// An OCR run that produced no usable cues fails this check.
pub fn is_valid(content: &str) -> bool {
    content
        .lines()
        .any(|line| TIMING_LINE.is_match(line.trim_start_matches('\u{feff}').trim()))
}

fn millis(h: &str, m: &str, s: &str, ms: &str) -> u64 {
    let n = |v: &str| v.parse::<u64>().unwrap_or(0);
    ((n(h) * 60 + n(m)) * 60 + n(s)) * 1000 + n(ms)
}

/// Parse cues, skipping blocks without a timing line
pub fn parse(content: &str) -> Vec<Cue> {
    let content = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let mut cues = Vec::new();
    for block in content.split("\n\n") {
        let mut lines = block.lines().map(str::trim_end).skip_while(|l| l.is_empty());
        let mut timing = None;
        for line in lines.by_ref() {
            if let Some(caps) = TIMING_LINE.captures(line.trim()) {
                timing = Some((
                    millis(&caps[1], &caps[2], &caps[3], &caps[4]),
                    millis(&caps[5], &caps[6], &caps[7], &caps[8]),
                ));
                break;
            }
        }
        if let Some((start_ms, end_ms)) = timing {
            cues.push(Cue {
                start_ms,
                end_ms,
                lines: lines.map(str::to_string).collect(),
            });
        }
    }
    cues
}

fn timestamp(ms: u64) -> String {
    format!(
        "{:02}:{:02}:{:02},{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

/// Render cues, numbering from 1; cues without text are dropped
pub fn write(cues: &[Cue]) -> String {
    let mut out = String::new();
    let mut index = 0;
    for cue in cues.iter().filter(|c| c.lines.iter().any(|l| !l.trim().is_empty())) {
        index += 1;
        out.push_str(&format!(
            "{}\n{} --> {}\n",
            index,
            timestamp(cue.start_ms),
            timestamp(cue.end_ms)
        ));
        for line in &cue.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\u{feff}1\r\n00:00:01,000 --> 00:00:02,500\r\nHello\r\nthere\r\n\r\n2\r\n01:02:03,004 --> 01:02:04,000\r\n[door slams]\r\n";

    #[test]
    fn test_validity() {
        assert!(is_valid(SAMPLE));
        assert!(!is_valid(""));
        assert!(!is_valid("1\n00:00:01 --> 00:00:02\nno millis\n"));
    }

    #[test]
    fn test_parse_handles_bom_and_crlf() {
        let cues = parse(SAMPLE);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].start_ms, 1000);
        assert_eq!(cues[0].end_ms, 2500);
        assert_eq!(cues[0].lines, vec!["Hello", "there"]);
        assert_eq!(cues[1].start_ms, 3_723_004);
    }

    #[test]
    fn test_write_renumbers_and_drops_empty() {
        let cues = vec![
            Cue { start_ms: 0, end_ms: 1000, lines: vec![String::new()] },
            Cue { start_ms: 3_723_004, end_ms: 3_724_000, lines: vec!["Hi".to_string()] },
        ];
        assert_eq!(write(&cues), "1\n01:02:03,004 --> 01:02:04,000\nHi\n\n");
    }

    #[test]
    fn test_parse_of_written_output() {
        let written = write(&parse(SAMPLE));
        assert_eq!(parse(&written), parse(SAMPLE));
    }
}
