//! Image subtitle OCR through a headless GUI tool.
//!
//! The tool keeps its recognition language in a settings file rather than
//! taking it on the command line. [`LanguageGate`] lets any number of runs
//! share one language and makes a language switch wait until they finish.

use super::ToolError;
use crate::config::ToolsConfig;
use crate::display::DisplayAllocator;
use crate::gui::{run_with_display, LAUNCH_FAILED};
use parking_lot::{Condvar, Mutex};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, LazyLock};

#[derive(Debug, Default)]
struct GateState {
    language: Option<String>,
    active: usize,
}

/// Serializes changes of the OCR tool's persisted language
#[derive(Debug)]
pub struct LanguageGate {
    settings_file: Option<PathBuf>,
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Held while an OCR run uses the gate's current language
pub struct LanguagePermit<'a> {
    gate: &'a LanguageGate,
}

impl Drop for LanguagePermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.gate.changed.notify_all();
        }
    }
}

impl LanguageGate {
    /// Gate over `settings_file`; without one, entering never rewrites anything
    pub fn new(settings_file: Option<PathBuf>) -> Self {
        Self {
            settings_file,
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
        }
    }

    /// Wait until `language` can be active, switching the settings file if
    /// no other run is using a different one.
    pub fn enter(&self, language: &str) -> std::io::Result<LanguagePermit<'_>> {
        let mut state = self.state.lock();
        while state.active > 0 && state.language.as_deref() != Some(language) {
            self.changed.wait(&mut state);
        }
        if state.language.as_deref() != Some(language) {
            if let Some(path) = &self.settings_file {
                set_settings_language(path, &tesseract_language(language))?;
            }
            tracing::debug!(language, "Switched OCR language");
            state.language = Some(language.to_string());
        }
        state.active += 1;
        Ok(LanguagePermit { gate: self })
    }

    pub fn current_language(&self) -> Option<String> {
        self.state.lock().language.clone()
    }
}

/// OCR dictionary name for a normalized language code
pub fn tesseract_language(language: &str) -> String {
    match language {
        "ger" => "deu",
        "fre" => "fra",
        "dut" => "nld",
        "chi" => "chi_sim",
        "cze" => "ces",
        "gre" => "ell",
        "rum" => "ron",
        other => other,
    }
    .to_string()
}

static LANGUAGE_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(<TesseractLanguage>)[^<]*(</TesseractLanguage>)").unwrap());

/// Replace the recognition language in the settings document
pub fn rewrite_settings_language(settings: &str, language: &str) -> String {
    if LANGUAGE_ELEMENT.is_match(settings) {
        LANGUAGE_ELEMENT
            .replace_all(settings, format!("${{1}}{}${{2}}", language).as_str())
            .into_owned()
    } else {
        settings.to_string()
    }
}

fn set_settings_language(path: &Path, language: &str) -> std::io::Result<()> {
    let current = std::fs::read_to_string(path)?;
    let updated = rewrite_settings_language(&current, language);
    if updated != current {
        std::fs::write(path, updated)?;
    }
    Ok(())
}

/// `<ocr_command...> /convert <input> subrip /outputfolder:<dir>`
pub fn build_ocr_command(tools: &ToolsConfig, input: &Path, output_dir: &Path) -> Option<Command> {
    let (program, leading) = tools.ocr_command.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(leading);
    cmd.arg("/convert").arg(input).arg("subrip");
    let mut folder = std::ffi::OsString::from("/outputfolder:");
    folder.push(output_dir.as_os_str());
    cmd.arg(folder);
    Some(cmd)
}

/// Where the tool writes its result for `input`
pub fn ocr_output_path(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default();
    let mut name = stem.to_os_string();
    name.push(".srt");
    output_dir.join(name)
}

/// Shared OCR context for one run
pub struct Ocr {
    tools: ToolsConfig,
    gate: LanguageGate,
    displays: Arc<DisplayAllocator>,
}

impl Ocr {
    pub fn new(tools: ToolsConfig, displays: Arc<DisplayAllocator>) -> Self {
        let gate = LanguageGate::new(tools.ocr_settings_file.clone());
        Self {
            tools,
            gate,
            displays,
        }
    }

    /// OCR `input` to SubRip in `output_dir` using `language`.
    ///
    /// Returns the path the tool was asked to write. The caller checks the
    /// result's content; a zero exit does not guarantee a usable file.
    pub fn convert(
        &self,
        input: &Path,
        output_dir: &Path,
        language: &str,
        memory_budget_gb: f32,
    ) -> Result<PathBuf, ToolError> {
        let cmd = build_ocr_command(&self.tools, input, output_dir).ok_or_else(|| {
            ToolError::Output {
                tool: "ocr".to_string(),
                reason: "no OCR command configured".to_string(),
            }
        })?;
        let command = super::describe(&cmd);

        let _permit = self.gate.enter(language).map_err(|source| ToolError::Launch {
            tool: "ocr settings".to_string(),
            source,
        })?;
        let run = run_with_display(&self.tools.xvfb, &self.displays, cmd, memory_budget_gb);

        match run.exit_code {
            0 => Ok(ocr_output_path(input, output_dir)),
            LAUNCH_FAILED => Err(ToolError::Launch {
                tool: "ocr".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "display server or OCR tool did not start",
                ),
            }),
            code if run.killed_for_memory => Err(ToolError::Failed {
                tool: "ocr".to_string(),
                code,
                command,
                stderr: format!("killed after exceeding {:.1} GB", memory_budget_gb),
            }),
            code => Err(ToolError::Failed {
                tool: "ocr".to_string(),
                code,
                command,
                stderr: String::new(),
            }),
        }
    }
}
