//! Application configuration
//!
//! Loaded from a TOML file with sensible gateway defaults; the auth token
//! can always be overridden through the `REALTIME_VOICE_TOKEN` environment
//! variable so it never has to live on disk.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable that overrides the configured auth token
pub const TOKEN_ENV: &str = "REALTIME_VOICE_TOKEN";

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub chat: ChatConfig,
    pub tts: TtsConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: AppConfig =
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.apply_env();
        Ok(config)
    }

    /// Load from a file if it exists, otherwise use defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            self.chat.token = token.clone();
            self.tts.token = token;
        }
    }
}

/// Voice chat session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Gateway host
    pub host: String,
    /// WebSocket path including the model query
    pub path: String,
    /// TLS port
    pub port: u16,
    /// Bearer token for the gateway
    pub token: String,
    /// Voice id requested in `session.update`
    pub voice: String,
    /// Seconds to wait for `session.created` after connecting
    pub created_timeout_secs: u64,
    /// Seconds to wait for `session.updated` after sending the session config
    pub updated_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            host: "ai-gateway.vei.volces.com".to_string(),
            path: "/v1/realtime?model=AG-voice-chat-agent".to_string(),
            port: 443,
            token: String::new(),
            voice: "zh_female_tianmeixiaoyuan_moon_bigtts".to_string(),
            created_timeout_secs: 30,
            updated_timeout_secs: 20,
        }
    }
}

impl ChatConfig {
    /// WebSocket URL for this gateway
    pub fn url(&self) -> String {
        format!("wss://{}:{}{}", self.host, self.port, self.path)
    }

    pub fn created_timeout(&self) -> Duration {
        Duration::from_secs(self.created_timeout_secs)
    }

    pub fn updated_timeout(&self) -> Duration {
        Duration::from_secs(self.updated_timeout_secs)
    }
}

/// Text-to-speech session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Gateway host
    pub host: String,
    /// WebSocket path including the model query
    pub path: String,
    /// TLS port
    pub port: u16,
    /// Bearer token for the gateway
    pub token: String,
    /// Voice id requested in `tts_session.update`
    pub voice: String,
    /// TTS model name
    pub model: String,
    /// Requested output sample rate
    pub output_sample_rate: u32,
    /// Seconds to wait for the WebSocket upgrade acknowledgment
    pub connect_timeout_secs: u64,
    /// Seconds to wait for `tts_session.updated` after sending the session config
    pub updated_timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            host: "ai-gateway.vei.volces.com".to_string(),
            path: "/v1/realtime?model=doubao-tts".to_string(),
            port: 443,
            token: String::new(),
            voice: "zh_female_kailangjiejie_moon_bigtts".to_string(),
            model: "doubao-tts".to_string(),
            output_sample_rate: 16000,
            connect_timeout_secs: 5,
            updated_timeout_secs: 5,
        }
    }
}

impl TtsConfig {
    /// WebSocket URL for this gateway
    pub fn url(&self) -> String {
        format!("wss://{}:{}{}", self.host, self.port, self.path)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn updated_timeout(&self) -> Duration {
        Duration::from_secs(self.updated_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.chat.port, 443);
        assert_eq!(config.chat.created_timeout(), Duration::from_secs(30));
        assert_eq!(config.chat.updated_timeout(), Duration::from_secs(20));
        assert_eq!(config.tts.output_sample_rate, 16000);
        assert!(config.chat.url().starts_with("wss://"));
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [chat]
            voice = "en_male_test"

            [tts]
            host = "gateway.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.chat.voice, "en_male_test");
        assert_eq!(config.chat.host, "ai-gateway.vei.volces.com");
        assert_eq!(config.tts.host, "gateway.example.com");
        assert_eq!(config.tts.model, "doubao-tts");
    }
}
