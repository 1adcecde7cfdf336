//! External subtitle download collaborator.
//!
//! The configured command is called once per missing language as
//! `<fetch_command...> <media> <output dir> <language>` and is expected to
//! leave candidate subtitle files in the output directory.

use super::{run_checked, ToolError};
use crate::config::ToolsConfig;
use std::path::{Path, PathBuf};
use std::process::Command;

pub fn build_fetch_command(
    tools: &ToolsConfig,
    media: &Path,
    output_dir: &Path,
    language: &str,
) -> Option<Command> {
    let (program, leading) = tools.fetch_command.as_ref()?.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(leading);
    cmd.arg(media).arg(output_dir).arg(language);
    Some(cmd)
}

/// Whether a fetch command is configured
pub fn enabled(tools: &ToolsConfig) -> bool {
    tools
        .fetch_command
        .as_ref()
        .is_some_and(|cmd| !cmd.is_empty())
}

/// Run the collaborator for one language and list what it produced
pub fn fetch(
    tools: &ToolsConfig,
    media: &Path,
    output_dir: &Path,
    language: &str,
) -> Result<Vec<PathBuf>, ToolError> {
    let mut cmd = build_fetch_command(tools, media, output_dir, language).ok_or_else(|| {
        ToolError::Output {
            tool: "fetch".to_string(),
            reason: "no fetch command configured".to_string(),
        }
    })?;
    run_checked(&mut cmd, "fetch", &[])?;

    let entries = std::fs::read_dir(output_dir).map_err(|e| ToolError::Output {
        tool: "fetch".to_string(),
        reason: format!("cannot list {}: {}", output_dir.display(), e),
    })?;
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// First candidate by extension priority; unlisted extensions never win
pub fn pick_by_extension<'a>(
    candidates: &'a [PathBuf],
    priority: &[String],
) -> Option<&'a PathBuf> {
    priority.iter().find_map(|wanted| {
        candidates.iter().find(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
        })
    })
}
