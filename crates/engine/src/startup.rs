//! Preflight checks
//!
//! Verifies the external tools are present before any file is touched:
//! - mkvmerge (with a version new enough for the flag names used) and mkvextract
//! - ffmpeg
//! - the display server and OCR tool, only when OCR may be needed
//! - the work directory is writable

use crate::config::Config;
use crate::tools::mkvmerge;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

/// First mkvmerge release with `--forced-display-flag`
pub const MIN_MKVMERGE_MAJOR: u32 = 57;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("mkvmerge version requirement not met: {0}")]
    MkvmergeVersion(String),

    #[error("Work directory {path} is not usable: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Run `<program> <args>` and return its stdout; fail if it cannot start or exits non-zero
fn version_output(program: &str, args: &[&str]) -> Result<String, StartupError> {
    let output = Command::new(program).args(args).output().map_err(|e| {
        StartupError::ToolUnavailable {
            tool: program.to_string(),
            reason: format!("is it installed and in PATH? Error: {}", e),
        }
    })?;
    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: program.to_string(),
            reason: format!("`{} {}` failed", program, args.join(" ")),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Only require that `<program> <args>` starts; some tools exit non-zero on `-version`
fn check_launchable(program: &str, args: &[&str]) -> Result<(), StartupError> {
    Command::new(program)
        .args(args)
        .output()
        .map(|_| ())
        .map_err(|e| StartupError::ToolUnavailable {
            tool: program.to_string(),
            reason: format!("failed to start: {}", e),
        })
}

/// Parse the major version out of `ffmpeg -version` output.
///
/// Handles `ffmpeg version 7.1 ...` and git builds like `ffmpeg version n7.1-...`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    version_part
        .trim_start_matches('n')
        .split(['.', '-'])
        .next()?
        .parse()
        .ok()
}

/// Check mkvmerge is present and recent enough; returns its major version
pub fn check_mkvmerge(cfg: &Config) -> Result<u32, StartupError> {
    let output = version_output(&cfg.tools.mkvmerge, &["--version"])?;
    let major = mkvmerge::parse_version(&output).ok_or_else(|| {
        StartupError::MkvmergeVersion(format!(
            "Could not parse mkvmerge version from output: {}",
            output.lines().next().unwrap_or("(empty)")
        ))
    })?;
    if major < MIN_MKVMERGE_MAJOR {
        return Err(StartupError::MkvmergeVersion(format!(
            "mkvmerge v{} or newer required, got v{}",
            MIN_MKVMERGE_MAJOR, major
        )));
    }
    Ok(major)
}

pub fn check_mkvextract(cfg: &Config) -> Result<(), StartupError> {
    version_output(&cfg.tools.mkvextract, &["--version"]).map(|_| ())
}

/// Check ffmpeg is present; returns its major version when it can be parsed
pub fn check_ffmpeg(cfg: &Config) -> Result<Option<u32>, StartupError> {
    let output = version_output(&cfg.tools.ffmpeg, &["-version"])?;
    Ok(parse_ffmpeg_version(&output))
}

/// Check the display server and OCR program can be started
pub fn check_ocr_tools(cfg: &Config) -> Result<(), StartupError> {
    check_launchable(&cfg.tools.xvfb, &["-version"])?;
    let program = cfg
        .tools
        .ocr_command
        .first()
        .ok_or_else(|| StartupError::ToolUnavailable {
            tool: "ocr".to_string(),
            reason: "no OCR command configured".to_string(),
        })?;
    check_launchable(program, &["--version"])
}

pub fn check_work_dir(cfg: &Config) -> Result<(), StartupError> {
    let path = &cfg.paths.work_dir;
    std::fs::create_dir_all(path)
        .and_then(|_| tempfile::tempfile_in(path).map(|_| ()))
        .map_err(|source| StartupError::WorkDir {
            path: path.clone(),
            source,
        })
}

/// Run all startup checks in order
///
/// OCR tools are only checked when `ocr_needed` is set, since most runs never
/// meet an image subtitle that needs converting.
pub fn run_startup_checks(cfg: &Config, ocr_needed: bool) -> Result<(), StartupError> {
    let mkvmerge_major = check_mkvmerge(cfg)?;
    check_mkvextract(cfg)?;
    let ffmpeg_major = check_ffmpeg(cfg)?;
    if ocr_needed {
        check_ocr_tools(cfg)?;
    }
    check_work_dir(cfg)?;
    tracing::info!(
        mkvmerge = mkvmerge_major,
        ffmpeg = ?ffmpeg_major,
        ocr_checked = ocr_needed,
        "Startup checks passed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config_with_tools(f: impl FnOnce(&mut Config)) -> Config {
        let mut cfg = Config::default();
        f(&mut cfg);
        cfg
    }

    #[test]
    fn test_missing_tool_is_reported_by_name() {
        let cfg = config_with_tools(|c| c.tools.mkvmerge = "definitely-not-mkvmerge-1234".into());
        let err = check_mkvmerge(&cfg).unwrap_err();
        assert!(err.to_string().contains("definitely-not-mkvmerge-1234"));
    }

    #[test]
    fn test_failing_version_command() {
        let cfg = config_with_tools(|c| c.tools.mkvextract = "false".into());
        assert!(matches!(
            check_mkvextract(&cfg),
            Err(StartupError::ToolUnavailable { .. })
        ));
    }

    #[test]
    fn test_unparseable_mkvmerge_version() {
        // `true` succeeds with empty output
        let cfg = config_with_tools(|c| c.tools.mkvmerge = "true".into());
        assert!(matches!(
            check_mkvmerge(&cfg),
            Err(StartupError::MkvmergeVersion(_))
        ));
    }

    #[test]
    fn test_ocr_tools_need_a_command() {
        let cfg = config_with_tools(|c| {
            c.tools.xvfb = "true".into();
            c.tools.ocr_command = Vec::new();
        });
        assert!(check_ocr_tools(&cfg).is_err());
    }

    #[test]
    fn test_work_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_with_tools(|c| c.paths.work_dir = dir.path().join("nested/work"));
        check_work_dir(&cfg).unwrap();
        assert!(dir.path().join("nested/work").is_dir());
    }

    #[test]
    fn test_parse_ffmpeg_version_formats() {
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version 7.1 Copyright (c) 2000-2024"),
            Some(7)
        );
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version n6.1-12-gabcdef0 Copyright"),
            Some(6)
        );
        assert_eq!(parse_ffmpeg_version("not ffmpeg"), None);
    }

    // **Feature: mkv-tidy, Property 12: Tool Version Parsing**
    //
    // *For any* mkvmerge or ffmpeg version banner, the parser SHALL extract
    // the major version number.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_mkvmerge_version_parsing(
            major in 1u32..200,
            minor in 0u32..10,
            name in "[A-Za-z ]{1,20}",
        ) {
            let banner = format!("mkvmerge v{}.{} ('{}') 64-bit", major, minor, name);
            prop_assert_eq!(mkvmerge::parse_version(&banner), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
            prefixed in proptest::bool::ANY,
        ) {
            let version = if prefixed {
                format!("n{}.{}-123-g{}", major, minor, git_hash)
            } else {
                format!("{}.{}", major, minor)
            };
            let banner = format!("ffmpeg version {} Copyright (c) 2000-2024", version);
            prop_assert_eq!(parse_ffmpeg_version(&banner), Some(major));
        }
    }
}
