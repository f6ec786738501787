//! Configuration for termbridge.
//!
//! Settings are read from `~/.termbridge/config.toml`:
//!
//! ```toml
//! # Shell started by the demo host (platform default when unset)
//! shell = "/bin/bash"
//! shell_args = ["-i"]
//!
//! # auto (PTY with pipe fallback), pty or pipe
//! transport = "auto"
//!
//! # Children on pipes read UTF-8; when false the ANSI code page is used
//! pipe_utf8 = true
//! legacy_encoding = "shift_jis"
//!
//! max_rows = 500
//! enter_sequence = "cr"   # or "crlf"
//! one_shot_timeout_secs = 30
//! startup_command = "ls"
//! debug = false
//!
//! [colors]
//! prompt = { r = 100, g = 255, b = 100 }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::keys::EnterSequence;
use crate::core::pty::TransportPreference;
use crate::core::session::SessionOptions;
use crate::core::term::{Rgb, DEFAULT_MAX_ROWS};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell program; platform default when unset
    pub shell: Option<String>,
    /// Arguments for `shell`
    pub shell_args: Vec<String>,
    pub transport: TransportPreference,
    pub pipe_utf8: bool,
    /// Fallback code page for non-UTF-8 pipes outside Windows
    pub legacy_encoding: String,
    pub max_rows: usize,
    pub enter_sequence: EnterSequence,
    pub write_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub one_shot_timeout_secs: u64,
    /// Programs started as long-lived sessions instead of one-shot commands
    pub interactive_programs: Vec<String>,
    /// Command run once the controller is ready
    pub startup_command: Option<String>,
    pub working_dir: Option<PathBuf>,
    /// Verbose logging
    pub debug: bool,
    pub colors: ColorConfig,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: None,
            shell_args: Vec::new(),
            transport: TransportPreference::Auto,
            pipe_utf8: true,
            legacy_encoding: "shift_jis".to_string(),
            max_rows: DEFAULT_MAX_ROWS,
            enter_sequence: EnterSequence::Cr,
            write_timeout_ms: 1000,
            stop_grace_ms: 3000,
            one_shot_timeout_secs: 30,
            interactive_programs: vec!["python".into(), "python3".into(), "node".into()],
            startup_command: None,
            working_dir: None,
            debug: false,
            colors: ColorConfig::default(),
        }
    }
}

/// Colors of the terminal surface and of inline status lines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub background: Rgb,
    pub foreground: Rgb,
    pub prompt: Rgb,
    pub error: Rgb,
    pub notice: Rgb,
    pub started: Rgb,
    /// Tint for stderr text that has no color of its own
    pub stderr: Rgb,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            background: Rgb::new(0x1e, 0x1e, 0x1e),
            foreground: Rgb::new(0xff, 0xff, 0xff),
            prompt: Rgb::new(100, 255, 100),
            error: Rgb::new(255, 0, 0),
            notice: Rgb::new(255, 255, 0),
            started: Rgb::new(0, 255, 0),
            stderr: Rgb::new(255, 100, 100),
        }
    }
}

impl TerminalConfig {
    /// Load `~/.termbridge/config.toml`, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// `~/.termbridge/config.toml`
    pub fn config_path() -> Option<PathBuf> {
        data_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            transport: self.transport,
            pipe_utf8: self.pipe_utf8,
            legacy_encoding: self.legacy_encoding.clone(),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }

    pub fn one_shot_timeout(&self) -> Duration {
        Duration::from_secs(self.one_shot_timeout_secs)
    }
}

/// `~/.termbridge`, where the config file and the log live
pub fn data_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".termbridge"))
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TerminalConfig::default();
        assert_eq!(config.max_rows, 500);
        assert_eq!(config.transport, TransportPreference::Auto);
        assert_eq!(config.enter_sequence, EnterSequence::Cr);
        assert_eq!(config.colors.prompt, Rgb::new(100, 255, 100));
        assert_eq!(config.one_shot_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = TerminalConfig::from_toml_str(
            r#"
            transport = "pipe"
            enter_sequence = "crlf"
            max_rows = 100

            [colors]
            prompt = { r = 1, g = 2, b = 3 }
            "#,
        )
        .unwrap();
        assert_eq!(config.transport, TransportPreference::Pipe);
        assert_eq!(config.enter_sequence, EnterSequence::CrLf);
        assert_eq!(config.max_rows, 100);
        assert_eq!(config.colors.prompt, Rgb::new(1, 2, 3));
        assert_eq!(config.colors.error, Rgb::new(255, 0, 0));
        assert!(config.pipe_utf8);
    }

    #[test]
    fn test_invalid_value_is_parse_error() {
        let result = TerminalConfig::from_toml_str("transport = \"telepathy\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "stop_grace_ms = 250\nstartup_command = \"ls\"\n").unwrap();

        let config = TerminalConfig::load_from(&path).unwrap();
        assert_eq!(config.session_options().stop_grace, Duration::from_millis(250));
        assert_eq!(config.startup_command.as_deref(), Some("ls"));

        let missing = TerminalConfig::load_from(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
