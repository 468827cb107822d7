//! TOML Configuration File Support
//!
//! Centralized configuration for the server, loaded from
//! `~/.config/parley/config.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the daemon)
//! 2. Environment variables (`PARLEY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:12393"
//! channel_capacity = 256
//! max_connections = 100
//!
//! [conversation]
//! playback_ack_timeout_secs = 60
//! max_member_failures = 3
//!
//! [character]
//! name = "Mao"
//! human_name = "Human"
//!
//! [vad]
//! prob_threshold = 0.4
//! db_threshold = 60.0
//! required_hits = 3
//! required_misses = 24
//!
//! [generator]
//! backend = "ollama"
//! model = "qwen2.5:latest"
//! system_prompt = "You are a cheerful streamer."
//!
//! [recognizer]
//! backend = "disabled"
//!
//! [synthesizer]
//! backend = "mute"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vad::VadConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the highest-priority configuration value came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// `[server]`: listener settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind: String,
    /// Outbound message buffer per client
    pub channel_capacity: usize,
    /// Open connections above which new ones are turned away
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:12393".to_string(),
            channel_capacity: 256,
            max_connections: 100,
        }
    }
}

/// `[conversation]`: turn pacing and rotation policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// How long a turn waits for `frontend-playback-complete`
    pub playback_ack_timeout_secs: u64,
    /// Consecutive failed turns after which a member leaves the rotation
    pub max_member_failures: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            playback_ack_timeout_secs: 60,
            max_member_failures: 3,
        }
    }
}

impl ConversationConfig {
    /// Playback acknowledgment timeout as a `Duration`
    #[must_use]
    pub fn playback_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.playback_ack_timeout_secs)
    }
}

/// `[character]`: who speaks and who is spoken to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterConfig {
    /// Name attached to reply display text
    pub name: String,
    /// Avatar reference attached to reply display text
    pub avatar: Option<String>,
    /// Name the human's lines are attributed to
    pub human_name: String,
}

impl Default for CharacterConfig {
    fn default() -> Self {
        Self {
            name: "AI".to_string(),
            avatar: None,
            human_name: "Human".to_string(),
        }
    }
}

/// Available reply generators
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    /// Repeats the input back
    #[default]
    Echo,
    /// Local Ollama server
    Ollama,
}

impl FromStr for GeneratorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "echo" => Ok(Self::Echo),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unknown generator backend '{other}'"
            ))),
        }
    }
}

/// `[generator]`: reply generation backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Which backend to use
    pub backend: GeneratorKind,
    /// Ollama host
    pub host: String,
    /// Ollama port
    pub port: u16,
    /// Model name
    pub model: String,
    /// System prompt
    pub system_prompt: Option<String>,
    /// Sampling temperature
    pub temperature: f32,
    /// What the echo backend says when given nothing
    pub greeting: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            backend: GeneratorKind::default(),
            host: "localhost".to_string(),
            port: 11434,
            model: "qwen2.5:latest".to_string(),
            system_prompt: None,
            temperature: 0.7,
            greeting: "Hello! I'm listening.".to_string(),
        }
    }
}

/// Available speech recognizers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognizerKind {
    /// Voice input is rejected, text input only
    #[default]
    Disabled,
}

/// `[recognizer]`: speech recognition backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Which backend to use
    pub backend: RecognizerKind,
}

/// Available speech synthesizers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesizerKind {
    /// No audio, replies are delivered as text
    #[default]
    Mute,
}

/// `[synthesizer]`: speech synthesis backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizerConfig {
    /// Which backend to use
    pub backend: SynthesizerKind,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Complete server configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    /// Listener settings
    pub server: ServerConfig,
    /// Turn pacing and rotation policy
    pub conversation: ConversationConfig,
    /// Character profile
    pub character: CharacterConfig,
    /// Voice activity detection tuning
    pub vad: VadConfig,
    /// Reply generation backend
    pub generator: GeneratorConfig,
    /// Speech recognition backend
    pub recognizer: RecognizerConfig,
    /// Speech synthesis backend
    pub synthesizer: SynthesizerConfig,
    /// Path the config was loaded from
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
    /// Where the highest-priority value came from
    #[serde(skip)]
    source: ConfigSource,
}

impl ParleyConfig {
    /// Where the highest-priority value came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Record that a higher-priority layer changed a value
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML or mistyped fields.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `PARLEY_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply `PARLEY_*` overrides using `lookup` as the environment
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let mut touched = false;

        if let Some(bind) = lookup("PARLEY_BIND") {
            self.server.bind = bind;
            touched = true;
        }
        if let Some(secs) = lookup("PARLEY_PLAYBACK_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.conversation.playback_ack_timeout_secs = secs;
            touched = true;
        }
        if let Some(name) = lookup("PARLEY_HUMAN_NAME") {
            self.character.human_name = name;
            touched = true;
        }
        if let Some(name) = lookup("PARLEY_CHARACTER_NAME") {
            self.character.name = name;
            touched = true;
        }
        if let Some(kind) = lookup("PARLEY_GENERATOR") {
            match kind.parse() {
                Ok(kind) => {
                    self.generator.backend = kind;
                    touched = true;
                }
                Err(e) => tracing::warn!(error = %e, "ignoring PARLEY_GENERATOR"),
            }
        }
        if let Some(host) = lookup("PARLEY_OLLAMA_HOST") {
            self.generator.host = host;
            touched = true;
        }
        if let Some(port) = lookup("PARLEY_OLLAMA_PORT").and_then(|v| v.parse().ok()) {
            self.generator.port = port;
            touched = true;
        }
        if let Some(model) = lookup("PARLEY_MODEL") {
            self.generator.model = model;
            touched = true;
        }

        if touched {
            self.source = ConfigSource::Env;
        }
    }

    /// Reject values the runtime cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.server.channel_capacity == 0 {
            return invalid("server.channel_capacity must be at least 1");
        }
        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be at least 1");
        }
        if self.vad.frame_samples == 0 {
            return invalid("vad.frame_samples must be at least 1");
        }
        if self.vad.smoothing_window == 0 {
            return invalid("vad.smoothing_window must be at least 1");
        }
        if self.vad.required_hits == 0 || self.vad.required_misses == 0 {
            return invalid("vad.required_hits and vad.required_misses must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.vad.prob_threshold) {
            return invalid("vad.prob_threshold must be within [0, 1]");
        }
        if self.conversation.max_member_failures == 0 {
            return invalid("conversation.max_member_failures must be at least 1");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default location of the config file
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("parley").join("config.toml"))
}

/// Load configuration from the default path
///
/// # Errors
///
/// See [`load_config_from_path`].
pub fn load_config() -> Result<ParleyConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from `path` (if it exists), then apply the environment
///
/// A missing file is not an error.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed, or
/// when the merged result fails validation.
pub fn load_config_from_path(path: Option<&Path>) -> Result<ParleyConfig, ConfigError> {
    let mut config = ParleyConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::Read {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            config = ParleyConfig::from_toml_str(&content)?;
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    config.apply_env();
    config.validate()?;
    Ok(config)
}
