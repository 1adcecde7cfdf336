//! Subtitle timing resync against the reference media.

use super::{run_checked, ToolError};
use crate::config::{ResyncConfig, ToolsConfig};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// Every attempt failed; carries the last failure
#[derive(Debug, thiserror::Error)]
#[error("resync failed after {attempts} attempts: {last}")]
pub struct RetryExhausted<E: std::error::Error + 'static> {
    pub attempts: u32,
    #[source]
    pub last: E,
}

/// Call `op` until it succeeds, at most `attempts` times, sleeping `delay`
/// between failures.
pub fn retry<T, E, F>(attempts: u32, delay: Duration, mut op: F) -> Result<T, RetryExhausted<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Result<T, E>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                return Err(RetryExhausted { attempts, last: e });
            }
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "Retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// `<resync_command...> <reference> -i <subtitle> -o <output>`
pub fn build_resync_command(
    tools: &ToolsConfig,
    reference: &Path,
    subtitle: &Path,
    output: &Path,
) -> Option<Command> {
    let (program, leading) = tools.resync_command.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(leading);
    cmd.arg(reference);
    cmd.arg("-i").arg(subtitle);
    cmd.arg("-o").arg(output);
    Some(cmd)
}

/// Resync `subtitle` in place, retrying per `policy`
pub fn resync(
    tools: &ToolsConfig,
    policy: &ResyncConfig,
    reference: &Path,
    subtitle: &Path,
) -> Result<(), RetryExhausted<ToolError>> {
    let mut synced = subtitle.as_os_str().to_os_string();
    synced.push(".synced");
    let synced = std::path::PathBuf::from(synced);

    retry(
        policy.attempts,
        Duration::from_secs(policy.delay_secs),
        |_| {
            let mut cmd = build_resync_command(tools, reference, subtitle, &synced).ok_or_else(
                || ToolError::Output {
                    tool: "resync".to_string(),
                    reason: "no resync command configured".to_string(),
                },
            )?;
            run_checked(&mut cmd, "resync", &[])?;
            std::fs::rename(&synced, subtitle).map_err(|e| ToolError::Output {
                tool: "resync".to_string(),
                reason: format!("could not replace {}: {}", subtitle.display(), e),
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_retry_succeeds_after_failures() {
        let calls = Cell::new(0);
        let result: Result<u32, RetryExhausted<std::io::Error>> =
            retry(3, Duration::ZERO, |attempt| {
                calls.set(calls.get() + 1);
                if attempt < 3 {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "flaky"))
                } else {
                    Ok(attempt)
                }
            });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_gives_up_at_bound() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry(3, Duration::ZERO, |_| {
            calls.set(calls.get() + 1);
            Err(std::io::Error::new(std::io::ErrorKind::Other, "down"))
        });
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.get(), 3);
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let calls = Cell::new(0);
        let _ = retry(0, Duration::ZERO, |_| -> Result<(), std::io::Error> {
            calls.set(calls.get() + 1);
            Ok(())
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_resync_command_layout() {
        let cmd = build_resync_command(
            &ToolsConfig::default(),
            Path::new("film.mkv"),
            Path::new("film.N..x.eng.srt"),
            Path::new("film.N..x.eng.srt.synced"),
        )
        .unwrap();
        let args: Vec<String> = cmd
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect();
        assert_eq!(cmd.get_program(), "ffsubsync");
        assert_eq!(
            args,
            vec!["film.mkv", "-i", "film.N..x.eng.srt", "-o", "film.N..x.eng.srt.synced"]
        );
    }

    #[test]
    fn test_resync_exhausts_on_failing_tool() {
        let tools = ToolsConfig {
            resync_command: vec!["false".to_string()],
            ..ToolsConfig::default()
        };
        let policy = ResyncConfig {
            attempts: 2,
            delay_secs: 0,
        };
        let err = resync(&tools, &policy, Path::new("a.mkv"), Path::new("a.srt")).unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(matches!(err.last, ToolError::Failed { .. }));
    }
}
