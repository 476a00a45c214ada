//! Configuration management for the voice core

pub mod file;

use std::time::Duration;

use secrecy::SecretString;

use crate::session::wire::Modality;
use crate::voice::DEFAULT_BLOCK_SIZE;
use crate::{Error, Result};

/// Live API WebSocket endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio dialogue model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Prebuilt voice
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Handshake budget, from socket open to `setupComplete`
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receptionist persona for the clinic
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "Tu es l'assistant vocal du 'Cabinet Dentaire Lumière' situé à Rabat-Agdal, Maroc. \
Tu es chaleureux, professionnel et bilingue (Français et Arabe) : réponds dans la langue de ton interlocuteur. \
Ton but est d'informer sur les 4 services principaux : Contrôle, Blanchiment, Implants et Urgences. \
Tes réponses sont courtes, adaptées à l'oral. Ne donne jamais de diagnostic médical complexe, \
suggère toujours un rendez-vous à Agdal.";

/// Negotiated configuration of one duplex session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Model identifier, with or without the `models/` prefix
    pub model: String,

    /// Response modality, always audio for the voice widget
    pub response_modality: Modality,

    /// Prebuilt voice name
    pub voice: String,

    /// System instruction text
    pub system_instruction: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            response_modality: Modality::Audio,
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

/// Voice core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Session configuration sent at connect
    pub session: SessionConfig,

    /// WebSocket endpoint of the Live API
    pub endpoint: String,

    /// API key (from `GEMINI_API_KEY` or `API_KEY`)
    pub api_key: Option<SecretString>,

    /// Time allowed for the session handshake
    pub connect_timeout: Duration,

    /// Samples per captured frame
    pub capture_block_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            capture_block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the config file, then environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        let file = file::load_config_file();
        let config = Self::default()
            .with_file(file)
            .with_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a parsed config file
    #[must_use]
    pub fn with_file(mut self, file: file::VoiceConfigFile) -> Self {
        let file::VoiceConfigFile { session, connection } = file;

        if let Some(model) = session.model {
            self.session.model = model;
        }
        if let Some(voice) = session.voice {
            self.session.voice = voice;
        }
        if let Some(instruction) = session.system_instruction {
            self.session.system_instruction = instruction;
        }
        if let Some(block_size) = session.capture_block_size {
            self.capture_block_size = block_size;
        }

        if let Some(endpoint) = connection.endpoint {
            self.endpoint = endpoint;
        }
        if let Some(key) = connection.api_key {
            self.api_key = Some(SecretString::from(key));
        }
        if let Some(secs) = connection.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }

        self
    }

    /// Overlay values from environment variables
    ///
    /// `lookup` abstracts `std::env::var` so the precedence can be tested.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GEMINI_API_KEY").or_else(|| non_empty("API_KEY")) {
            self.api_key = Some(SecretString::from(key));
        }
        if let Some(model) = non_empty("LUMIERE_MODEL") {
            self.session.model = model;
        }
        if let Some(voice) = non_empty("LUMIERE_VOICE") {
            self.session.voice = voice;
        }
        if let Some(endpoint) = non_empty("LUMIERE_ENDPOINT") {
            self.endpoint = endpoint;
        }

        self
    }

    /// Check invariants the session relies on
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.capture_block_size == 0 {
            return Err(Error::Config("capture block size must be positive".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect timeout must be positive".to_string()));
        }
        if self.session.model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".to_string()));
        }
        if self.session.voice.trim().is_empty() {
            return Err(Error::Config("voice must not be empty".to_string()));
        }
        Ok(())
    }
}
