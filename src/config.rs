use std::env;
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::errors::ChatError;

const CONFIG_PATH_ENV: &str = "PHARMAAI_CONFIG_PATH";
const SECRET_KEY_ENV: &str = "PHARMAAI_SECRET_KEY";

/// Typed runtime configuration. Every field has a default so a partial
/// `config.yml` is enough; the only value that must be supplied (file or
/// environment) is `auth.secret_key`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    pub llm: LlmSettings,
    pub retrieval: RetrievalSettings,
    pub chat: ChatSettings,
    pub websocket: WebSocketSettings,
    pub rate_limit: RateLimitSettings,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub chat_path: PathBuf,
    pub index_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    /// L2 distance cutoff. Candidates at or above this score are discarded.
    pub score_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub history_limit: i64,
    pub title_max_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    pub heartbeat_interval_secs: u64,
    pub connection_timeout_secs: u64,
    pub max_connections_per_user: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub messages_per_minute: u32,
    pub burst_size: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            chat_path: PathBuf::from("pharmaai.db"),
            index_path: PathBuf::from("pharmaai_index.db"),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_string(),
            model: "PharmaAI-4B".to_string(),
            temperature: 0.7,
            max_tokens: 512,
            embedding_model: "pharma-embed".to_string(),
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            score_threshold: 1.2,
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            history_limit: 5,
            title_max_len: 50,
        }
    }
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            connection_timeout_secs: 60,
            max_connections_per_user: 3,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            messages_per_minute: 20,
            burst_size: 5,
        }
    }
}

impl Settings {
    /// Reads the config file (path overridable via `PHARMAAI_CONFIG_PATH`),
    /// applies the secret-key environment fallback and validates.
    pub fn load() -> Result<Self, ChatError> {
        let path = config_path();
        let mut settings = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|err| {
                ChatError::Config(format!("failed to read {}: {err}", path.display()))
            })?;
            serde_yaml::from_str::<Settings>(&contents).map_err(|err| {
                ChatError::Config(format!("failed to parse {}: {err}", path.display()))
            })?
        } else {
            tracing::warn!("config file {} not found, using defaults", path.display());
            Settings::default()
        };

        if settings.auth.secret_key.trim().is_empty() {
            if let Ok(secret) = env::var(SECRET_KEY_ENV) {
                settings.auth.secret_key = secret;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.auth.secret_key.trim().is_empty() {
            return Err(ChatError::Config(format!(
                "auth.secret_key must be set (config file or {SECRET_KEY_ENV})"
            )));
        }
        if self.rate_limit.messages_per_minute == 0 {
            return Err(ChatError::Config(
                "rate_limit.messages_per_minute must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.burst_size == 0 {
            return Err(ChatError::Config(
                "rate_limit.burst_size must be at least 1".to_string(),
            ));
        }
        if self.websocket.max_connections_per_user == 0 {
            return Err(ChatError::Config(
                "websocket.max_connections_per_user must be at least 1".to_string(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(ChatError::Config(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }
        if self.retrieval.score_threshold <= 0.0 {
            return Err(ChatError::Config(
                "retrieval.score_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    PathBuf::from("config.yml")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            database: DatabaseSettings::default(),
            auth: AuthSettings::default(),
            llm: LlmSettings::default(),
            retrieval: RetrievalSettings::default(),
            chat: ChatSettings::default(),
            websocket: WebSocketSettings::default(),
            rate_limit: RateLimitSettings::default(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Settings {
        let mut settings = Settings::default();
        settings.auth.secret_key = "test-secret".to_string();
        settings
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.websocket.heartbeat_interval_secs, 30);
        assert_eq!(settings.websocket.connection_timeout_secs, 60);
        assert_eq!(settings.websocket.max_connections_per_user, 3);
        assert_eq!(settings.rate_limit.messages_per_minute, 20);
        assert_eq!(settings.rate_limit.burst_size, 5);
        assert_eq!(settings.retrieval.top_k, 3);
        assert_eq!(settings.chat.history_limit, 5);
        assert_eq!(settings.chat.title_max_len, 50);
        assert_eq!(settings.llm.model, "PharmaAI-4B");
    }

    #[test]
    fn partial_yaml_fills_missing_sections_with_defaults() {
        let yaml = r#"
server:
  port: 9100
auth:
  secret_key: from-file
rate_limit:
  burst_size: 2
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.auth.secret_key, "from-file");
        assert_eq!(settings.rate_limit.burst_size, 2);
        assert_eq!(settings.rate_limit.messages_per_minute, 20);
        assert_eq!(settings.retrieval.score_threshold, 1.2);
    }

    #[test]
    fn validate_rejects_blank_secret() {
        let settings = Settings::default();
        assert!(matches!(settings.validate(), Err(ChatError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_rate_values() {
        let mut settings = configured();
        settings.rate_limit.messages_per_minute = 0;
        assert!(settings.validate().is_err());

        let mut settings = configured();
        settings.rate_limit.burst_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = configured();
        settings.websocket.max_connections_per_user = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_accepts_configured_defaults() {
        assert!(configured().validate().is_ok());
    }
}
