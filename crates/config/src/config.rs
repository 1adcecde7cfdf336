//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// CPU and memory ceilings used to size the stage worker pools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Share of total CPU the run may occupy, in percent (default 80)
    #[serde(default = "default_ceiling_percent")]
    pub cpu_ceiling_percent: f32,
    /// Share of total memory the OCR workers may occupy, in percent (default 80)
    #[serde(default = "default_ceiling_percent")]
    pub memory_ceiling_percent: f32,
    /// Memory budget of a single OCR task, display server included
    #[serde(default = "default_memory_per_ocr_worker_gb")]
    pub memory_per_ocr_worker_gb: f32,
    /// Processes spawned by one OCR task, relative to a plain worker
    #[serde(default = "default_ocr_process_multiplier")]
    pub ocr_process_multiplier: f32,
    /// Hard cap on general workers (0 = auto-derive)
    #[serde(default)]
    pub max_workers: u32,
    /// Hard cap on OCR workers (0 = auto-derive)
    #[serde(default)]
    pub max_ocr_workers: u32,
}

fn default_ceiling_percent() -> f32 {
    80.0
}

fn default_memory_per_ocr_worker_gb() -> f32 {
    1.5
}

fn default_ocr_process_multiplier() -> f32 {
    1.4
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_ceiling_percent: default_ceiling_percent(),
            memory_ceiling_percent: default_ceiling_percent(),
            memory_per_ocr_worker_gb: default_memory_per_ocr_worker_gb(),
            ocr_process_multiplier: default_ocr_process_multiplier(),
            max_workers: 0,
            max_ocr_workers: 0,
        }
    }
}

/// Audio track preferences
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// Preferred languages, most wanted first
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    /// Comma separated codec preference, e.g. `"ac3:6,orig"`; `"false"` disables conversion
    #[serde(default = "default_codecs")]
    pub codecs: String,
    /// Drop commentary tracks
    #[serde(default = "default_true")]
    pub remove_commentary: bool,
    /// Language assumed for tracks tagged `und`
    #[serde(default = "default_fallback_language")]
    pub fallback_language: String,
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

fn default_codecs() -> String {
    "orig".to_string()
}

fn default_true() -> bool {
    true
}

fn default_fallback_language() -> String {
    "eng".to_string()
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            languages: default_languages(),
            codecs: default_codecs(),
            remove_commentary: true,
            fallback_language: default_fallback_language(),
        }
    }
}

/// Where forced subtitle tracks end up in the kept list
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForcedPriority {
    First,
    #[default]
    Last,
    None,
}

impl ForcedPriority {
    /// Parse the lowercase name used in config files and env vars
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "first" => Some(ForcedPriority::First),
            "last" => Some(ForcedPriority::Last),
            "none" => Some(ForcedPriority::None),
            _ => None,
        }
    }
}

/// Subtitle track preferences
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtitleConfig {
    /// Preferred languages, most wanted first
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default)]
    pub forced_priority: ForcedPriority,
    /// Strip hearing-impaired annotations from SubRip tracks
    #[serde(default = "default_true")]
    pub remove_sdh: bool,
    /// Also drop music-only cues while stripping SDH
    #[serde(default = "default_true")]
    pub remove_music: bool,
    /// Only keep subtitles in the main audio language
    #[serde(default)]
    pub main_audio_language_only: bool,
    /// Remove every subtitle track
    #[serde(default)]
    pub remove_all: bool,
    /// Extension order used when picking among fetched subtitle files
    #[serde(default = "default_extension_priority")]
    pub extension_priority: Vec<String>,
    /// Resync converted tracks too, not only fetched ones
    #[serde(default)]
    pub resync_converted: bool,
}

fn default_extension_priority() -> Vec<String> {
    ["srt", "ass", "sup", "sub"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            languages: default_languages(),
            forced_priority: ForcedPriority::default(),
            remove_sdh: true,
            remove_music: true,
            main_audio_language_only: false,
            remove_all: false,
            extension_priority: default_extension_priority(),
            resync_converted: false,
        }
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_mkvmerge")]
    pub mkvmerge: String,
    #[serde(default = "default_mkvextract")]
    pub mkvextract: String,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_xvfb")]
    pub xvfb: String,
    /// OCR program and leading arguments, e.g. `["mono", "SubtitleEdit.exe"]`
    #[serde(default = "default_ocr_command")]
    pub ocr_command: Vec<String>,
    /// Settings file in which the OCR tool keeps its recognition language
    #[serde(default)]
    pub ocr_settings_file: Option<PathBuf>,
    #[serde(default = "default_resync_command")]
    pub resync_command: Vec<String>,
    /// Subtitle downloader; fetching is disabled when unset
    #[serde(default)]
    pub fetch_command: Option<Vec<String>>,
}

fn default_mkvmerge() -> String {
    "mkvmerge".to_string()
}

fn default_mkvextract() -> String {
    "mkvextract".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_xvfb() -> String {
    "Xvfb".to_string()
}

fn default_ocr_command() -> Vec<String> {
    vec![
        "mono".to_string(),
        "/opt/subtitleedit/SubtitleEdit.exe".to_string(),
    ]
}

fn default_resync_command() -> Vec<String> {
    vec!["ffsubsync".to_string()]
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mkvmerge: default_mkvmerge(),
            mkvextract: default_mkvextract(),
            ffmpeg: default_ffmpeg(),
            xvfb: default_xvfb(),
            ocr_command: default_ocr_command(),
            ocr_settings_file: None,
            resync_command: default_resync_command(),
            fetch_command: None,
        }
    }
}

/// Retry policy for the subtitle resync tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResyncConfig {
    #[serde(default = "default_resync_attempts")]
    pub attempts: u32,
    #[serde(default = "default_resync_delay_secs")]
    pub delay_secs: u64,
}

fn default_resync_attempts() -> u32 {
    3
}

fn default_resync_delay_secs() -> u64 {
    5
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            attempts: default_resync_attempts(),
            delay_secs: default_resync_delay_secs(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Root for per-file work directories
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Keep the `<name>.orig.<timestamp>` backup after replacing a file
    #[serde(default)]
    pub keep_original: bool,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/mkv-tidy")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            keep_original: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub subtitles: SubtitleConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub resync: ResyncConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Split a comma separated env value into trimmed, non-empty entries
fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MKV_TIDY_CPU_CEILING -> resources.cpu_ceiling_percent
    /// - MKV_TIDY_MEMORY_CEILING -> resources.memory_ceiling_percent
    /// - MKV_TIDY_MAX_WORKERS -> resources.max_workers
    /// - MKV_TIDY_MAX_OCR_WORKERS -> resources.max_ocr_workers
    /// - MKV_TIDY_AUDIO_LANGUAGES -> audio.languages (comma separated)
    /// - MKV_TIDY_AUDIO_CODECS -> audio.codecs
    /// - MKV_TIDY_SUBTITLE_LANGUAGES -> subtitles.languages (comma separated)
    /// - MKV_TIDY_FORCED_PRIORITY -> subtitles.forced_priority
    /// - MKV_TIDY_WORK_DIR -> paths.work_dir
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("MKV_TIDY_CPU_CEILING") {
            if let Ok(pct) = val.parse::<f32>() {
                self.resources.cpu_ceiling_percent = pct;
            }
        }

        if let Ok(val) = env::var("MKV_TIDY_MEMORY_CEILING") {
            if let Ok(pct) = val.parse::<f32>() {
                self.resources.memory_ceiling_percent = pct;
            }
        }

        if let Ok(val) = env::var("MKV_TIDY_MAX_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.resources.max_workers = workers;
            }
        }

        if let Ok(val) = env::var("MKV_TIDY_MAX_OCR_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.resources.max_ocr_workers = workers;
            }
        }

        if let Ok(val) = env::var("MKV_TIDY_AUDIO_LANGUAGES") {
            let langs = parse_list(&val);
            if !langs.is_empty() {
                self.audio.languages = langs;
            }
        }

        if let Ok(val) = env::var("MKV_TIDY_AUDIO_CODECS") {
            if !val.trim().is_empty() {
                self.audio.codecs = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("MKV_TIDY_SUBTITLE_LANGUAGES") {
            let langs = parse_list(&val);
            if !langs.is_empty() {
                self.subtitles.languages = langs;
            }
        }

        if let Ok(val) = env::var("MKV_TIDY_FORCED_PRIORITY") {
            // Unknown values keep the existing setting
            if let Some(priority) = ForcedPriority::parse(&val) {
                self.subtitles.forced_priority = priority;
            }
        }

        if let Ok(val) = env::var("MKV_TIDY_WORK_DIR") {
            if !val.is_empty() {
                self.paths.work_dir = PathBuf::from(val);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        for key in [
            "MKV_TIDY_CPU_CEILING",
            "MKV_TIDY_MEMORY_CEILING",
            "MKV_TIDY_MAX_WORKERS",
            "MKV_TIDY_MAX_OCR_WORKERS",
            "MKV_TIDY_AUDIO_LANGUAGES",
            "MKV_TIDY_AUDIO_CODECS",
            "MKV_TIDY_SUBTITLE_LANGUAGES",
            "MKV_TIDY_FORCED_PRIORITY",
            "MKV_TIDY_WORK_DIR",
        ] {
            env::remove_var(key);
        }
    }

    fn lang_list() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-z]{3}", 1..5)
    }

    // **Feature: mkv-tidy, Property 11: Configuration Parsing and Environment Override**
    //
    // *For any* valid TOML configuration string and set of environment variable overrides,
    // the loaded configuration SHALL parse every section and let the environment win.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            cpu in 1.0f32..100.0,
            mem in 1.0f32..100.0,
            max_workers in 0u32..64,
            audio_langs in lang_list(),
            sub_langs in lang_list(),
            remove_commentary in proptest::bool::ANY,
            forced_idx in 0usize..3,
            attempts in 1u32..10,
        ) {
            let forced = ["first", "last", "none"][forced_idx];
            let quote = |v: &[String]| {
                v.iter().map(|l| format!("\"{}\"", l)).collect::<Vec<_>>().join(", ")
            };
            let toml_str = format!(
                r#"
[resources]
cpu_ceiling_percent = {}
memory_ceiling_percent = {}
max_workers = {}

[audio]
languages = [{}]
codecs = "ac3:6,orig"
remove_commentary = {}

[subtitles]
languages = [{}]
forced_priority = "{}"

[resync]
attempts = {}
"#,
                cpu, mem, max_workers, quote(&audio_langs), remove_commentary,
                quote(&sub_langs), forced, attempts
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert!((config.resources.cpu_ceiling_percent - cpu).abs() < 0.0001);
            prop_assert!((config.resources.memory_ceiling_percent - mem).abs() < 0.0001);
            prop_assert_eq!(config.resources.max_workers, max_workers);
            prop_assert_eq!(&config.audio.languages, &audio_langs);
            prop_assert_eq!(config.audio.codecs.as_str(), "ac3:6,orig");
            prop_assert_eq!(config.audio.remove_commentary, remove_commentary);
            prop_assert_eq!(&config.subtitles.languages, &sub_langs);
            prop_assert_eq!(Some(config.subtitles.forced_priority), ForcedPriority::parse(forced));
            prop_assert_eq!(config.resync.attempts, attempts);
            prop_assert_eq!(config.resync.delay_secs, 5);
        }

        #[test]
        fn prop_env_overrides_ceilings(
            initial in 10.0f32..90.0,
            override_cpu in 1.0f32..100.0,
            override_mem in 1.0f32..100.0,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[resources]\ncpu_ceiling_percent = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("MKV_TIDY_CPU_CEILING", override_cpu.to_string());
            env::set_var("MKV_TIDY_MEMORY_CEILING", override_mem.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert!((config.resources.cpu_ceiling_percent - override_cpu).abs() < 0.0001);
            prop_assert!((config.resources.memory_ceiling_percent - override_mem).abs() < 0.0001);
        }

        #[test]
        fn prop_env_overrides_worker_caps(
            override_workers in 0u32..64,
            override_ocr in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml("").expect("Valid TOML");

            env::set_var("MKV_TIDY_MAX_WORKERS", override_workers.to_string());
            env::set_var("MKV_TIDY_MAX_OCR_WORKERS", override_ocr.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.resources.max_workers, override_workers);
            prop_assert_eq!(config.resources.max_ocr_workers, override_ocr);
        }

        #[test]
        fn prop_env_overrides_language_lists(
            audio_langs in lang_list(),
            sub_langs in lang_list(),
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml("").expect("Valid TOML");

            env::set_var("MKV_TIDY_AUDIO_LANGUAGES", audio_langs.join(", "));
            env::set_var("MKV_TIDY_SUBTITLE_LANGUAGES", sub_langs.join(","));
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.audio.languages, audio_langs);
            prop_assert_eq!(config.subtitles.languages, sub_langs);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert!((config.resources.cpu_ceiling_percent - 80.0).abs() < 0.0001);
        assert!((config.resources.ocr_process_multiplier - 1.4).abs() < 0.0001);
        assert_eq!(config.resources.max_workers, 0);
        assert_eq!(config.audio.languages, vec!["eng".to_string()]);
        assert_eq!(config.audio.codecs, "orig");
        assert!(config.audio.remove_commentary);
        assert_eq!(config.subtitles.forced_priority, ForcedPriority::Last);
        assert_eq!(config.subtitles.extension_priority[0], "srt");
        assert_eq!(config.resync.attempts, 3);
        assert_eq!(config.tools.mkvmerge, "mkvmerge");
        assert!(config.tools.fetch_command.is_none());
        assert!(!config.paths.keep_original);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[subtitles]
remove_all = true
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert!(config.subtitles.remove_all);
        assert!(config.subtitles.remove_sdh); // default
        assert_eq!(config.subtitles.languages, vec!["eng".to_string()]); // default
        assert_eq!(config.resources, ResourceConfig::default());
    }

    #[test]
    fn test_invalid_forced_priority_env_is_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml("[subtitles]\nforced_priority = \"first\"\n")
            .expect("Valid TOML");
        env::set_var("MKV_TIDY_FORCED_PRIORITY", "sideways");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.subtitles.forced_priority, ForcedPriority::First);
    }

    #[test]
    fn test_unknown_forced_priority_in_file_is_rejected() {
        let result = Config::parse_toml("[subtitles]\nforced_priority = \"sideways\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
