use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chat::sampler::SamplingParams;
use crate::models::Session;
use log::info;

/// Environment variable that overrides `server_url`.
pub const SERVER_URL_ENV: &str = "LLAMA_SERVER_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

// Chat client configuration, read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_server_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("logs/llama_chat.log")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            session: Session::default(),
            sampling: SamplingParams::default(),
            log_file: default_log_file(),
            log_level: default_log_level(),
        }
    }
}

pub fn parse_config(json: &str) -> Result<ChatConfig, ConfigError> {
    Ok(serde_json::from_str(json)?)
}

/// Load configuration from `path`, or defaults when no path is given.
/// `LLAMA_SERVER_URL` wins over the file's `server_url`.
pub fn load_config(path: Option<&Path>) -> Result<ChatConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            info!("Loaded config from {}", path.display());
            parse_config(&json)?
        }
        None => ChatConfig::default(),
    };

    apply_server_override(&mut config, std::env::var(SERVER_URL_ENV).ok());
    Ok(config)
}

fn apply_server_override(config: &mut ChatConfig, url: Option<String>) {
    if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
        info!("Using server url from {SERVER_URL_ENV}: {url}");
        config.server_url = url;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.server_url, "http://127.0.0.1:8080");
        assert_eq!(config.session.char, "Yoav");
        assert_eq!(config.sampling.n_predict, 400);
        assert_eq!(config.log_file, PathBuf::from("logs/llama_chat.log"));
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = parse_config(
            r#"{"session":{"char":"Ada","historyTemplate":"{{name}} said {{message}}"},
                "sampling":{"top_k":10}}"#,
        )
        .unwrap();

        assert_eq!(config.session.char, "Ada");
        assert_eq!(config.session.user, "User");
        assert_eq!(config.session.history_template, "{{name}} said {{message}}");
        assert!(config.session.transcript.is_empty());
        assert_eq!(config.sampling.top_k, 10);
        assert_eq!(config.sampling.temperature, 0.7);
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(parse_config("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config(Some(Path::new("does/not/exist.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_server_override() {
        let mut config = ChatConfig::default();
        apply_server_override(&mut config, Some("  ".to_string()));
        assert_eq!(config.server_url, "http://127.0.0.1:8080");

        apply_server_override(&mut config, Some("http://gpu-box:8080".to_string()));
        assert_eq!(config.server_url, "http://gpu-box:8080");
    }
}
