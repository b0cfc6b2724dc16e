use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub gateway_url: String,
    pub gateway_token: Option<String>,
    pub speech_url: Option<String>,
    pub voice: String,
    pub locale: String,
    pub data_dir: PathBuf,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gateway_url = std::env::var("GATEWAY_URL")
            .map_err(|_| ConfigError::MissingVar("GATEWAY_URL".to_string()))?;
        if !gateway_url.starts_with("ws://") && !gateway_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(
                "GATEWAY_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", gateway_url),
            ));
        }

        let gateway_token = std::env::var("GATEWAY_TOKEN").ok();
        let speech_url = std::env::var("SPEECH_URL").ok();
        let voice =
            std::env::var("SPEECH_VOICE").unwrap_or_else(|_| "en-US-AvaNeural".to_string());
        let locale = std::env::var("LOCALE").unwrap_or_else(|_| "en-US".to_string());

        let data_dir = match std::env::var("DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sage"),
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            gateway_url,
            gateway_token,
            speech_url,
            voice,
            locale,
            data_dir,
            log_level,
        })
    }
}
