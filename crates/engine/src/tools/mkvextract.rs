//! mkvextract: pull tracks out of the container into staged files.

use super::{run_checked, ToolError};
use crate::config::ToolsConfig;
use std::path::{Path, PathBuf};
use std::process::Command;

/// `mkvextract <input> tracks <id>:<path> ...`
pub fn build_extract_command(
    tools: &ToolsConfig,
    input: &Path,
    targets: &[(u32, PathBuf)],
) -> Command {
    let mut cmd = Command::new(&tools.mkvextract);
    cmd.arg(input).arg("tracks");
    for (id, path) in targets {
        let mut spec = std::ffi::OsString::from(format!("{}:", id));
        spec.push(path.as_os_str());
        cmd.arg(spec);
    }
    cmd
}

/// Extract every `(track id, destination)` pair in one pass.
///
/// Fails if mkvextract fails or any destination is missing afterwards.
pub fn extract(
    tools: &ToolsConfig,
    input: &Path,
    targets: &[(u32, PathBuf)],
) -> Result<(), ToolError> {
    if targets.is_empty() {
        return Ok(());
    }
    run_checked(
        &mut build_extract_command(tools, input, targets),
        "mkvextract",
        &[1],
    )?;
    if let Some((id, path)) = targets.iter().find(|(_, path)| !path.exists()) {
        return Err(ToolError::Output {
            tool: "mkvextract".to_string(),
            reason: format!("track {} was not written to {}", id, path.display()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_command_layout() {
        let targets = vec![
            (2, PathBuf::from("/work/film.N..2.eng.sup")),
            (5, PathBuf::from("/work/film.F..5.eng.srt")),
        ];
        let cmd = build_extract_command(&ToolsConfig::default(), Path::new("film.mkv"), &targets);
        let args: Vec<String> = cmd
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect();
        assert_eq!(cmd.get_program(), "mkvextract");
        assert_eq!(
            args,
            vec![
                "film.mkv",
                "tracks",
                "2:/work/film.N..2.eng.sup",
                "5:/work/film.F..5.eng.srt"
            ]
        );
    }

    #[test]
    fn test_nothing_to_extract() {
        let tools = ToolsConfig {
            mkvextract: "definitely-not-a-real-tool-1234".into(),
            ..ToolsConfig::default()
        };
        assert!(extract(&tools, Path::new("film.mkv"), &[]).is_ok());
    }
}
