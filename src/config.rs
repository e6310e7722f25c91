//! Configuration Loader
//! - Provides CLI argument parsing with clap
//! - Reads `isorun.toml` for option defaults and environment variables
//!
//! Precedence for every boolean option: CLI flag, then settings file, then
//! the built-in default.

use clap::{ArgAction, Parser, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Settings file looked up in the working directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "isorun.toml";

// =============================================================================
// CLI Configuration
// =============================================================================

/// Output format for run results
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable progress (to stderr)
    #[default]
    Human,
    /// Machine-readable NDJSON (to stdout)
    Json,
}

/// Run registered test suites, each test in its own process
#[derive(Parser, Debug)]
#[command(name = "isorun", version, disable_version_flag = true)]
pub struct Cli {
    /// Print version and exit
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: (),

    /// Print a list of all available tests
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Run one test and wait for a debugger to attach to the test
    #[arg(long, value_name = "PATTERN")]
    pub debug: Option<String>,

    /// Print output in color [default: on when output is a terminal and NO_COLOR is unset]
    #[arg(short = 'c', long, overrides_with = "no_color")]
    color: bool,

    /// Print output without color
    #[arg(long, overrides_with = "color")]
    no_color: bool,

    /// Rerun failed tests and wait for a debugger to attach [default: off]
    #[arg(short = 'r', long, overrides_with = "no_rerun")]
    rerun: bool,

    /// Do not rerun failed tests
    #[arg(long, overrides_with = "rerun")]
    no_rerun: bool,

    /// Fail a test once its timeout elapsed [default: on]
    #[arg(short = 't', long, overrides_with = "no_timeout")]
    timeout: bool,

    /// Let tests run past their timeout
    #[arg(long, overrides_with = "timeout")]
    no_timeout: bool,

    /// Print the pid of every test process [default: off]
    #[arg(short = 'p', long, overrides_with = "no_pid")]
    pid: bool,

    /// Do not print test process ids
    #[arg(long, overrides_with = "pid")]
    no_pid: bool,

    /// Output format (also: ISORUN_FORMAT env var)
    #[arg(long, value_enum, default_value_t = OutputFormat::Human, env = "ISORUN_FORMAT")]
    pub format: OutputFormat,

    /// Path to generate JUnit XML report (also: ISORUN_JUNIT_XML env var)
    #[arg(long, env = "ISORUN_JUNIT_XML")]
    pub junit_xml: Option<PathBuf>,

    /// Settings file (also: ISORUN_CONFIG env var) [default: isorun.toml]
    #[arg(long, env = "ISORUN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run only tests matching these patterns (suite or suite:glob)
    #[arg(value_name = "PATTERN")]
    pub patterns: Vec<String>,
}

/// `Some(true)` for `--x`, `Some(false)` for `--no-x`, `None` if neither was given
fn flag_pair(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl Cli {
    pub fn color_flag(&self) -> Option<bool> {
        flag_pair(self.color, self.no_color)
    }

    pub fn rerun_flag(&self) -> Option<bool> {
        flag_pair(self.rerun, self.no_rerun)
    }

    pub fn timeout_flag(&self) -> Option<bool> {
        flag_pair(self.timeout, self.no_timeout)
    }

    pub fn pid_flag(&self) -> Option<bool> {
        flag_pair(self.pid, self.no_pid)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Merge flags over `settings`; `default_color` applies when neither sets color
    pub fn resolve(&self, settings: &Settings, default_color: bool) -> Options {
        let file = &settings.options;
        Options {
            color: self.color_flag().or(file.color).unwrap_or(default_color),
            rerun: self.rerun_flag().or(file.rerun).unwrap_or(false),
            timeout: self.timeout_flag().or(file.timeout).unwrap_or(true),
            pid: self.pid_flag().or(file.pid).unwrap_or(false),
            format: self.format,
            junit_xml: self.junit_xml.clone(),
        }
    }
}

/// Effective options of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub color: bool,
    pub rerun: bool,
    pub timeout: bool,
    pub pid: bool,
    pub format: OutputFormat,
    pub junit_xml: Option<PathBuf>,
}

// =============================================================================
// Settings File
// =============================================================================

/// Contents of `isorun.toml`
#[derive(Deserialize, Default, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub options: OptionDefaults,
    /// Exported into the process before any test is spawned
    pub env: BTreeMap<String, String>,
}

#[derive(Deserialize, Default, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OptionDefaults {
    pub color: Option<bool>,
    pub rerun: Option<bool>,
    pub timeout: Option<bool>,
    pub pid: Option<bool>,
}

/// Load the settings file at `path`.
///
/// A missing file yields the defaults. A file that cannot be read or parsed
/// is reported on stderr and ignored.
pub fn load_settings(path: &Path) -> Settings {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no settings file");
        return Settings::default();
    }

    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[config] Failed to read {}: {}", path.display(), e);
            return Settings::default();
        }
    };

    match toml::from_str(&contents) {
        Ok(settings) => {
            tracing::debug!(path = %path.display(), "loaded settings file");
            settings
        }
        Err(e) => {
            eprintln!("[config] Failed to parse {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

/// Export the `[env]` table into the current process.
///
/// Must run before the first test process is forked so every test inherits it.
pub fn apply_env(settings: &Settings) {
    for (key, value) in &settings.env {
        std::env::set_var(key, value);
        tracing::debug!(key = %key, "set environment variable from settings");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("isorun").chain(args.iter().copied())).unwrap()
    }

    fn write_settings(contents: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        let mut file = fs::File::create(&path).unwrap();
        write!(file, "{}", contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]);
        let options = cli.resolve(&Settings::default(), false);
        assert!(!options.color);
        assert!(!options.rerun);
        assert!(options.timeout);
        assert!(!options.pid);
        assert!(cli.patterns.is_empty());
        assert!(cli.debug.is_none());
        assert!(!cli.list);
    }

    #[test]
    fn test_default_color_used_when_unset() {
        let options = parse(&[]).resolve(&Settings::default(), true);
        assert!(options.color);
    }

    #[test]
    fn test_short_and_negated_flags() {
        let options = parse(&["-c", "-r", "--no-timeout"]).resolve(&Settings::default(), false);
        assert!(options.color);
        assert!(options.rerun);
        assert!(!options.timeout);

        let options = parse(&["--no-color", "-t"]).resolve(&Settings::default(), true);
        assert!(!options.color);
        assert!(options.timeout);
    }

    #[test]
    fn test_last_flag_wins() {
        let cli = parse(&["--color", "--no-color"]);
        assert_eq!(cli.color_flag(), Some(false));

        let cli = parse(&["--no-rerun", "--rerun"]);
        assert_eq!(cli.rerun_flag(), Some(true));
    }

    #[test]
    fn test_patterns_and_debug() {
        let cli = parse(&["math", "strings:con*", "--debug", "math:add"]);
        assert_eq!(cli.patterns, vec!["math", "strings:con*"]);
        assert_eq!(cli.debug.as_deref(), Some("math:add"));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Cli::try_parse_from(["isorun", "--bogus"]).is_err());
        assert!(Cli::try_parse_from(["isorun", "--debug"]).is_err());
    }

    #[test]
    fn test_version_flag_short() {
        let err = Cli::try_parse_from(["isorun", "-v"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_settings_file_defaults_overridden_by_flags() {
        let (_dir, path) = write_settings(
            r#"
[options]
color = true
rerun = true
timeout = false

[env]
ISORUN_TEST_SETTING = "from-file"
"#,
        );

        let settings = load_settings(&path);
        assert_eq!(settings.options.color, Some(true));
        assert_eq!(settings.env.get("ISORUN_TEST_SETTING").map(String::as_str), Some("from-file"));

        let options = parse(&[]).resolve(&settings, false);
        assert!(options.color);
        assert!(options.rerun);
        assert!(!options.timeout);

        let options = parse(&["--no-color", "--timeout"]).resolve(&settings, false);
        assert!(!options.color);
        assert!(options.timeout);
    }

    #[test]
    fn test_missing_settings_file() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings(&dir.path().join("absent.toml"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_malformed_settings_file_ignored() {
        let (_dir, path) = write_settings("[options]\ncolor = \"yes\"\n");
        assert_eq!(load_settings(&path), Settings::default());

        let (_dir, path) = write_settings("[unknown]\nx = 1\n");
        assert_eq!(load_settings(&path), Settings::default());
    }

    #[test]
    fn test_apply_env() {
        let mut settings = Settings::default();
        settings
            .env
            .insert("ISORUN_APPLY_ENV_TEST".to_string(), "42".to_string());

        apply_env(&settings);
        assert_eq!(std::env::var("ISORUN_APPLY_ENV_TEST").unwrap(), "42");
    }

    #[test]
    fn test_config_path_default() {
        assert_eq!(parse(&[]).config_path(), PathBuf::from(DEFAULT_CONFIG_FILE));
        assert_eq!(
            parse(&["--config", "ci.toml"]).config_path(),
            PathBuf::from("ci.toml")
        );
    }
}
