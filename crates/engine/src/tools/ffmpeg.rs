//! ffmpeg: audio decode/encode and text subtitle conversion.

use super::{run_checked, ToolError};
use crate::config::ToolsConfig;
use std::path::Path;
use std::process::Command;

/// How ffmpeg produces one target codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoder {
    pub name: &'static str,
    /// Extension of the elementary stream file
    pub ext: &'static str,
    pub extra_args: &'static [&'static str],
}

const fn plain(name: &'static str, ext: &'static str) -> Encoder {
    Encoder {
        name,
        ext,
        extra_args: &[],
    }
}

/// Encoder for a codec preference name (`ac3`, `eac3`, `aac`, ...)
pub fn encoder_for(codec: &str) -> Option<Encoder> {
    let encoder = match codec.to_lowercase().as_str() {
        "ac3" => plain("ac3", "ac3"),
        "eac3" => plain("eac3", "eac3"),
        "aac" => plain("aac", "aac"),
        "flac" => plain("flac", "flac"),
        "opus" => plain("libopus", "opus"),
        "mp3" => plain("libmp3lame", "mp3"),
        // The native DTS encoder is still marked experimental
        "dts" => Encoder {
            name: "dca",
            ext: "dts",
            extra_args: &["-strict", "-2"],
        },
        _ => return None,
    };
    Some(encoder)
}

fn base_command(tools: &ToolsConfig, input: &Path) -> Command {
    let mut cmd = Command::new(&tools.ffmpeg);
    cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y"]);
    cmd.arg("-i").arg(input);
    cmd
}

/// Decode the first audio stream of `input` to PCM wav
pub fn build_decode_command(tools: &ToolsConfig, input: &Path, wav: &Path) -> Command {
    let mut cmd = base_command(tools, input);
    cmd.args(["-map", "0:a:0", "-vn", "-c:a", "pcm_s24le"]);
    cmd.arg(wav);
    cmd
}

/// Encode a wav file with `encoder`, optionally downmixing to `channels`
pub fn build_encode_command(
    tools: &ToolsConfig,
    wav: &Path,
    encoder: &Encoder,
    channels: Option<u32>,
    output: &Path,
) -> Command {
    let mut cmd = base_command(tools, wav);
    cmd.arg("-c:a").arg(encoder.name);
    cmd.args(encoder.extra_args);
    if let Some(channels) = channels {
        cmd.arg("-ac").arg(channels.to_string());
    }
    cmd.arg(output);
    cmd
}

/// Convert an SSA/ASS subtitle file to SubRip
pub fn build_text_subtitle_command(tools: &ToolsConfig, input: &Path, srt: &Path) -> Command {
    let mut cmd = base_command(tools, input);
    cmd.args(["-c:s", "srt", "-f", "srt"]);
    cmd.arg(srt);
    cmd
}

fn run_to(mut cmd: Command, output: &Path) -> Result<(), ToolError> {
    let result = run_checked(&mut cmd, "ffmpeg", &[]);
    if let Err(e) = result {
        let _ = std::fs::remove_file(output);
        return Err(e);
    }
    let written = std::fs::metadata(output).map(|m| m.len() > 0).unwrap_or(false);
    if !written {
        return Err(ToolError::Output {
            tool: "ffmpeg".to_string(),
            reason: format!("{} is missing or empty", output.display()),
        });
    }
    Ok(())
}

pub fn decode(tools: &ToolsConfig, input: &Path, wav: &Path) -> Result<(), ToolError> {
    run_to(build_decode_command(tools, input, wav), wav)
}

pub fn encode(
    tools: &ToolsConfig,
    wav: &Path,
    encoder: &Encoder,
    channels: Option<u32>,
    output: &Path,
) -> Result<(), ToolError> {
    run_to(build_encode_command(tools, wav, encoder, channels, output), output)
}

pub fn convert_text_subtitle(
    tools: &ToolsConfig,
    input: &Path,
    srt: &Path,
) -> Result<(), ToolError> {
    run_to(build_text_subtitle_command(tools, input, srt), srt)
}
