//! Session configuration
//!
//! Loaded from an optional TOML file in the platform config directory,
//! with the API credential overridable from the environment. Everything
//! has a default except the credential, which must be present before a
//! session will even attempt to connect.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants::{CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::error::Error;

/// Environment variable overriding the configured API key.
pub const API_KEY_ENV: &str = "VOICE_SESSION_API_KEY";

/// Configuration for one voice session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// API credential for the conversational endpoint. Empty means the
    /// voice assistant is unconfigured.
    pub api_key: String,

    /// WebSocket URL of the conversational service.
    pub service_url: String,

    /// Primary endpoint (model variant) identifier.
    pub endpoint: String,

    /// Fallback endpoint identifiers, tried in order after the primary.
    pub fallback_endpoints: Vec<String>,

    /// Microphone capture rate in Hz.
    pub capture_sample_rate: u32,

    /// Synthesized speech playback rate in Hz.
    pub playback_sample_rate: u32,

    /// Samples per outbound capture frame.
    pub capture_frame_samples: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            service_url:
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
                    .to_string(),
            endpoint: "gemini-2.5-flash-preview-native-audio-dialog".to_string(),
            fallback_endpoints: vec![
                "gemini-live-2.5-flash-preview".to_string(),
                "gemini-2.0-flash-live-001".to_string(),
            ],
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            capture_frame_samples: CAPTURE_FRAME_SAMPLES,
        }
    }
}

impl SessionConfig {
    /// Load from the default config path if present, then apply
    /// environment overrides.
    pub fn load() -> crate::Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::load_from_path(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a specific TOML file.
    pub fn load_from_path(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Platform config file location, e.g. `~/.config/voice-session/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "voice-session").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Overlay values from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV) {
            if !key.is_empty() {
                self.api_key = key;
            }
        }
    }

    /// Check that a session could be attempted with this configuration.
    ///
    /// A missing credential is fatal and must be reported before any
    /// connection attempt.
    pub fn validate(&self) -> crate::Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::Config("no API credential configured".to_string()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(Error::Config("no endpoint configured".to_string()));
        }
        if self.capture_frame_samples == 0 {
            return Err(Error::Config("capture frame size must be non-zero".to_string()));
        }
        if self.capture_sample_rate == 0 || self.playback_sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".to_string()));
        }
        Ok(())
    }

    /// The ordered endpoint candidate list: primary first, then fallbacks.
    pub fn candidates(&self) -> Vec<String> {
        std::iter::once(self.endpoint.clone())
            .chain(self.fallback_endpoints.iter().cloned())
            .collect()
    }
}
