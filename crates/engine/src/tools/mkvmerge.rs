//! mkvmerge: identification, track stripping and repacking.

use super::{run_checked, ToolError};
use crate::config::ToolsConfig;
use crate::plan::FilePlan;
use crate::staged::{StagedName, StagedNameError};
use crate::track::{Track, TrackKind};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// mkvmerge exits with 1 when it finished with warnings only
const WARNINGS_EXIT: i32 = 1;

/// Error type for identification
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("Invalid mkvmerge JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("mkvmerge could not read {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

/// Error type for building a repack command
#[derive(Debug, Error)]
pub enum RepackError {
    #[error("Artifact {path} is not a staged file: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: StagedNameError,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),
}

pub fn build_probe_command(tools: &ToolsConfig, path: &Path) -> Command {
    let mut cmd = Command::new(&tools.mkvmerge);
    cmd.arg("-J").arg(path);
    cmd
}

/// Identify a file's tracks with `mkvmerge -J`
pub fn probe(tools: &ToolsConfig, path: &Path) -> Result<Vec<Track>, ProbeError> {
    if !path.exists() {
        return Err(ProbeError::NotFound(path.to_path_buf()));
    }
    let output = run_checked(&mut build_probe_command(tools, path), "mkvmerge", &[WARNINGS_EXIT])?;
    let json: Value = serde_json::from_slice(&output.stdout)?;
    parse_identification(&json, path)
}

/// Turn mkvmerge's identification JSON into the file's track list
pub fn parse_identification(json: &Value, path: &Path) -> Result<Vec<Track>, ProbeError> {
    let errors: Vec<String> = json
        .get("errors")
        .and_then(|e| e.as_array())
        .map(|errs| {
            errs.iter()
                .filter_map(|e| e.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if !errors.is_empty() {
        return Err(ProbeError::Unreadable {
            path: path.to_path_buf(),
            reason: errors.join("; "),
        });
    }

    let recognized = json
        .get("container")
        .and_then(|c| c.get("recognized"))
        .and_then(|r| r.as_bool())
        .unwrap_or(false);
    if !recognized {
        return Err(ProbeError::Unreadable {
            path: path.to_path_buf(),
            reason: "container not recognized".to_string(),
        });
    }

    let tracks = json
        .get("tracks")
        .and_then(|t| t.as_array())
        .map(|tracks| tracks.iter().filter_map(parse_track).collect())
        .unwrap_or_default();
    Ok(tracks)
}

fn parse_track(track: &Value) -> Option<Track> {
    let kind = TrackKind::from_mkvmerge(track.get("type")?.as_str()?)?;
    let id = u32::try_from(track.get("id")?.as_u64()?).ok()?;
    let properties = track.get("properties");
    let prop_str = |key: &str| {
        properties
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };
    let prop_bool = |key: &str| {
        properties
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };

    let codec = prop_str("codec_id")
        .or_else(|| track.get("codec").and_then(|c| c.as_str()).map(|s| s.to_string()))
        .unwrap_or_default();

    Some(Track {
        id,
        kind,
        codec,
        language: prop_str("language").unwrap_or_else(|| crate::track::UNDETERMINED.to_string()),
        name: prop_str("track_name").unwrap_or_default(),
        forced: prop_bool("forced_track"),
        default: prop_bool("default_track"),
    })
}

fn flag(id: impl std::fmt::Display, on: bool) -> String {
    format!("{}:{}", id, if on { 1 } else { 0 })
}

fn id_list(ids: &[u32]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn video_ids(tracks: &[Track]) -> Vec<u32> {
    tracks
        .iter()
        .filter(|t| t.kind == TrackKind::Video)
        .map(|t| t.id)
        .collect()
}

/// Build the mkvmerge command that keeps exactly the planned tracks.
///
/// Kept tracks are written in plan order with default flags on the planned
/// default tracks and forced flags carried over.
pub fn build_strip_command(
    tools: &ToolsConfig,
    input: &Path,
    output: &Path,
    tracks: &[Track],
    plan: &FilePlan,
) -> Command {
    let mut cmd = Command::new(&tools.mkvmerge);
    cmd.arg("-o").arg(output);

    let audio_ids = plan.audio.kept_ids();
    if audio_ids.is_empty() {
        cmd.arg("--no-audio");
    } else {
        cmd.arg("--audio-tracks").arg(id_list(&audio_ids));
    }
    let sub_ids = plan.subtitles.kept_ids();
    if sub_ids.is_empty() {
        cmd.arg("--no-subtitles");
    } else {
        cmd.arg("--subtitle-tracks").arg(id_list(&sub_ids));
    }

    for r in &plan.audio.kept {
        cmd.arg("--default-track-flag")
            .arg(flag(r.id, plan.audio.default_track_id == Some(r.id)));
    }
    for r in &plan.subtitles.kept {
        cmd.arg("--default-track-flag")
            .arg(flag(r.id, plan.subtitles.default_track_id == Some(r.id)));
        cmd.arg("--forced-display-flag").arg(flag(r.id, r.forced));
    }

    let order: Vec<String> = video_ids(tracks)
        .into_iter()
        .chain(audio_ids)
        .chain(sub_ids)
        .map(|id| format!("0:{}", id))
        .collect();
    cmd.arg("--track-order").arg(order.join(","));

    cmd.arg(input);
    cmd
}

/// Remux `input` into `output` with only the planned tracks.
///
/// A partial output is removed on failure.
pub fn strip(
    tools: &ToolsConfig,
    input: &Path,
    output: &Path,
    tracks: &[Track],
    plan: &FilePlan,
) -> Result<(), ToolError> {
    let mut cmd = build_strip_command(tools, input, output, tracks, plan);
    run_checked(&mut cmd, "mkvmerge", &[WARNINGS_EXIT])
        .map(|_| ())
        .map_err(|e| {
            let _ = std::fs::remove_file(output);
            e
        })
}

/// One entry of the repacked file's audio/subtitle layout
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutItem {
    /// Track kept from the source container
    Container {
        id: u32,
        kind: TrackKind,
        default: bool,
        forced: bool,
    },
    /// Staged file added as a new track; metadata comes from its name
    Artifact {
        path: PathBuf,
        kind: TrackKind,
        default: bool,
    },
}

/// Build the mkvmerge command that merges the source's retained tracks with
/// the staged artifacts, in `layout` order.
pub fn build_repack_command(
    tools: &ToolsConfig,
    source: &Path,
    output: &Path,
    tracks: &[Track],
    layout: &[LayoutItem],
) -> Result<Command, RepackError> {
    let mut cmd = Command::new(&tools.mkvmerge);
    cmd.arg("-o").arg(output);

    let container_ids = |want: TrackKind| -> Vec<u32> {
        layout
            .iter()
            .filter_map(|item| match item {
                LayoutItem::Container { id, kind, .. } if *kind == want => Some(*id),
                _ => None,
            })
            .collect()
    };
    let audio_ids = container_ids(TrackKind::Audio);
    let sub_ids = container_ids(TrackKind::Subtitle);

    if audio_ids.is_empty() {
        cmd.arg("--no-audio");
    } else {
        cmd.arg("--audio-tracks").arg(id_list(&audio_ids));
    }
    if sub_ids.is_empty() {
        cmd.arg("--no-subtitles");
    } else {
        cmd.arg("--subtitle-tracks").arg(id_list(&sub_ids));
    }
    for item in layout {
        if let LayoutItem::Container {
            id,
            kind,
            default,
            forced,
        } = item
        {
            cmd.arg("--default-track-flag").arg(flag(id, *default));
            if *kind == TrackKind::Subtitle {
                cmd.arg("--forced-display-flag").arg(flag(id, *forced));
            }
        }
    }
    cmd.arg(source);

    let mut order: Vec<String> = video_ids(tracks)
        .into_iter()
        .map(|id| format!("0:{}", id))
        .collect();
    let mut file_index = 0;
    for item in layout {
        match item {
            LayoutItem::Container { id, .. } => order.push(format!("0:{}", id)),
            LayoutItem::Artifact {
                path,
                kind: _,
                default,
            } => {
                let staged = StagedName::from_path(path).map_err(|source| RepackError::Artifact {
                    path: path.clone(),
                    source,
                })?;
                file_index += 1;
                cmd.arg("--language").arg(format!("0:{}", staged.language));
                if !staged.name.is_empty() {
                    cmd.arg("--track-name").arg(format!("0:{}", staged.name));
                }
                cmd.arg("--default-track-flag").arg(flag(0, *default));
                cmd.arg("--forced-display-flag").arg(flag(0, staged.forced));
                cmd.arg(path);
                order.push(format!("{}:0", file_index));
            }
        }
    }
    cmd.arg("--track-order").arg(order.join(","));
    Ok(cmd)
}

/// Merge the source with staged artifacts into `output`.
///
/// A partial output is removed on failure.
pub fn repack(
    tools: &ToolsConfig,
    source: &Path,
    output: &Path,
    tracks: &[Track],
    layout: &[LayoutItem],
) -> Result<(), RepackError> {
    let mut cmd = build_repack_command(tools, source, output, tracks, layout)?;
    run_checked(&mut cmd, "mkvmerge", &[WARNINGS_EXIT]).map_err(|e| {
        let _ = std::fs::remove_file(output);
        e
    })?;
    Ok(())
}

/// mkvmerge version line, e.g. `mkvmerge v80.0 ('Roundabout') 64-bit`
pub fn parse_version(output: &str) -> Option<u32> {
    let line = output.lines().find(|l| l.trim_start().starts_with("mkvmerge"))?;
    let version = line.split_whitespace().nth(1)?;
    version
        .trim_start_matches('v')
        .split('.')
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::classify::test_support::*;
    use serde_json::json;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn identification() -> Value {
        json!({
            "container": { "recognized": true, "supported": true, "type": "Matroska" },
            "errors": [],
            "tracks": [
                { "id": 0, "type": "video", "codec": "AVC/H.264/MPEG-4p10",
                  "properties": { "codec_id": "V_MPEG4/ISO/AVC", "language": "und" } },
                { "id": 1, "type": "audio", "codec": "DTS",
                  "properties": { "codec_id": "A_DTS", "language": "eng",
                                  "track_name": "DTS-HD MA 5.1", "default_track": true } },
                { "id": 2, "type": "audio", "codec": "AC-3",
                  "properties": { "codec_id": "A_AC3", "language": "jpn" } },
                { "id": 3, "type": "subtitles", "codec": "HDMV PGS",
                  "properties": { "codec_id": "S_HDMV/PGS", "language": "eng",
                                  "forced_track": true } },
                { "id": 4, "type": "subtitles", "codec": "SubRip/SRT",
                  "properties": { "language": "nob" } },
                { "id": 5, "type": "buttons", "codec": "x", "properties": {} }
            ]
        })
    }

    #[test]
    fn test_parse_identification() {
        let tracks = parse_identification(&identification(), Path::new("a.mkv")).unwrap();
        assert_eq!(tracks.len(), 5);
        assert_eq!(tracks[1].codec, "A_DTS");
        assert_eq!(tracks[1].name, "DTS-HD MA 5.1");
        assert!(tracks[1].default);
        assert!(tracks[3].forced);
        assert_eq!(tracks[3].kind, TrackKind::Subtitle);
        // Falls back to the codec name when codec_id is absent
        assert_eq!(tracks[4].codec, "SubRip/SRT");
    }

    #[test]
    fn test_parse_identification_rejects_errors() {
        let json = json!({ "container": { "recognized": false }, "errors": ["truncated EBML"] });
        let err = parse_identification(&json, Path::new("bad.mkv")).unwrap_err();
        assert!(err.to_string().contains("truncated EBML"));

        let json = json!({ "container": { "recognized": false }, "errors": [] });
        assert!(parse_identification(&json, Path::new("bad.mkv")).is_err());
    }

    #[test]
    fn test_probe_missing_file() {
        let err = probe(&ToolsConfig::default(), Path::new("/nonexistent/file.mkv")).unwrap_err();
        assert!(matches!(err, ProbeError::NotFound(_)));
    }

    #[test]
    fn test_strip_command_keeps_plan() {
        let tracks = parse_identification(&identification(), Path::new("a.mkv")).unwrap();
        let prefs = prefs_with(|cfg| {
            cfg.audio.languages = vec!["jpn".to_string(), "eng".to_string()];
            cfg.subtitles.languages = vec!["nor".to_string()];
        });
        let plan = classify(&tracks, &prefs);
        let cmd = build_strip_command(
            &ToolsConfig::default(),
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &tracks,
            &plan,
        );
        let args = args(&cmd);

        assert_eq!(cmd.get_program(), "mkvmerge");
        assert!(has_flag_with_value(&args, "-o", "out.mkv"));
        assert!(has_flag_with_value(&args, "--audio-tracks", "2,1"));
        assert!(has_flag_with_value(&args, "--subtitle-tracks", "4"));
        assert!(has_flag_with_value(&args, "--default-track-flag", "2:1"));
        assert!(has_flag_with_value(&args, "--default-track-flag", "1:0"));
        assert!(has_flag_with_value(&args, "--forced-display-flag", "4:0"));
        assert!(has_flag_with_value(&args, "--track-order", "0:0,0:2,0:1,0:4"));
        assert_eq!(args.last().map(String::as_str), Some("in.mkv"));
    }

    #[test]
    fn test_strip_command_without_subtitles() {
        let tracks = vec![audio(1, "A_AC3", "eng"), subtitle(2, "S_TEXT/UTF8", "eng")];
        let prefs = prefs_with(|cfg| cfg.subtitles.remove_all = true);
        let plan = classify(&tracks, &prefs);
        let cmd = build_strip_command(
            &ToolsConfig::default(),
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &tracks,
            &plan,
        );
        let args = args(&cmd);
        assert!(args.contains(&"--no-subtitles".to_string()));
        assert!(has_flag_with_value(&args, "--track-order", "0:1"));
    }

    #[test]
    fn test_failed_strip_removes_partial_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let fake = crate::tools::test_support::script(
            dir.path(),
            "mkvmerge",
            "echo partial > \"$2\"\nexit 2",
        );
        let tools = ToolsConfig {
            mkvmerge: fake.to_string_lossy().into_owned(),
            ..ToolsConfig::default()
        };
        let tracks = vec![audio(1, "A_AC3", "eng"), audio(2, "A_AC3", "ger")];
        let plan = classify(&tracks, &prefs_with(|_| {}));
        let output = dir.path().join("out.mkv");

        let err = strip(&tools, Path::new("in.mkv"), &output, &tracks, &plan).unwrap_err();
        assert!(matches!(err, ToolError::Failed { code: 2, .. }));
        assert!(!output.exists());

        // Exit code 1 is mkvmerge's "finished with warnings"
        let warned = crate::tools::test_support::script(
            dir.path(),
            "mkvmerge-warn",
            "echo done > \"$2\"\nexit 1",
        );
        let tools = ToolsConfig {
            mkvmerge: warned.to_string_lossy().into_owned(),
            ..ToolsConfig::default()
        };
        strip(&tools, Path::new("in.mkv"), &output, &tracks, &plan).unwrap();
        assert!(output.exists());
    }

    #[test]
    fn test_repack_command_reads_artifact_names() {
        let tracks = vec![
            track(0, TrackKind::Video, "V_MPEG4/ISO/AVC", "und"),
            audio(1, "A_AC3", "eng"),
            subtitle(2, "S_HDMV/PGS", "eng"),
        ];
        let srt = StagedName::new("film", false, "English SDH", Some(2), "eng", "srt");
        let layout = vec![
            LayoutItem::Container {
                id: 1,
                kind: TrackKind::Audio,
                default: true,
                forced: false,
            },
            LayoutItem::Artifact {
                path: srt.path_in(Path::new("/work")),
                kind: TrackKind::Subtitle,
                default: true,
            },
        ];
        let cmd = build_repack_command(
            &ToolsConfig::default(),
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &tracks,
            &layout,
        )
        .unwrap();
        let args = args(&cmd);

        assert!(has_flag_with_value(&args, "--audio-tracks", "1"));
        assert!(args.contains(&"--no-subtitles".to_string()));
        assert!(has_flag_with_value(&args, "--language", "0:eng"));
        assert!(has_flag_with_value(&args, "--track-name", "0:English SDH"));
        assert!(has_flag_with_value(&args, "--forced-display-flag", "0:0"));
        assert!(has_flag_with_value(&args, "--track-order", "0:0,0:1,1:0"));
        assert!(args.contains(&srt.path_in(Path::new("/work")).display().to_string()));
    }

    #[test]
    fn test_repack_rejects_unstaged_artifact() {
        let layout = vec![LayoutItem::Artifact {
            path: PathBuf::from("/work/random.srt"),
            kind: TrackKind::Subtitle,
            default: false,
        }];
        let result = build_repack_command(
            &ToolsConfig::default(),
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &[],
            &layout,
        );
        assert!(matches!(result, Err(RepackError::Artifact { .. })));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("mkvmerge v80.0 ('Roundabout') 64-bit"), Some(80));
        assert_eq!(parse_version("mkvmerge v9.8.0 ('Kuglblitz')"), Some(9));
        assert_eq!(parse_version("something else"), None);
    }
}
