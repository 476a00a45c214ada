//! TOML configuration file loading
//!
//! Supports `~/.config/lumiere/voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Session negotiation settings
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Connection settings
    #[serde(default)]
    pub connection: ConnectionFileConfig,
}

/// Session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Model identifier
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Zephyr")
    pub voice: Option<String>,

    /// System instruction text
    pub system_instruction: Option<String>,

    /// Samples per captured frame
    pub capture_block_size: Option<usize>,
}

/// Connection configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConnectionFileConfig {
    /// WebSocket endpoint override
    pub endpoint: Option<String>,

    /// API key; prefer the `GEMINI_API_KEY` env var
    pub api_key: Option<String>,

    /// Handshake timeout in seconds
    pub connect_timeout_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceConfigFile {
    config_file_path().map_or_else(VoiceConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> VoiceConfigFile {
    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/lumiere/voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("lumiere")
            .join("voice")
            .join("config.toml")
    })
}
