use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Root configuration for chatgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub model: ModelConfig,
    pub limits: LimitsConfig,
    pub gateway: GatewayConfig,
}

/// Managed relational store (Supabase project) credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub url: String,
    pub service_key: String,
}

/// External identity provider. Defaults to the store's project URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub api_key: String,
    pub api_base: Option<String>,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f64,
    pub system_instruction: Option<String>,
    /// Newest N messages sent as model context.
    pub history_window: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: None,
            model: "gemini-2.5-flash-lite".to_string(),
            max_output_tokens: 1024,
            temperature: 0.7,
            system_instruction: None,
            history_window: 10,
        }
    }
}

/// Admission quotas. A signed-in user gets the guest allowance plus a
/// bonus, 8 prompts total with the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    pub guest_limit: u32,
    pub user_bonus: u32,
}

impl LimitsConfig {
    pub fn user_limit(&self) -> u32 {
        self.guest_limit + self.user_bonus
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            guest_limit: 5,
            user_bonus: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            // Vite / CRA dev server origins the frontend runs on.
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
                "http://localhost:5174".to_string(),
            ],
        }
    }
}

impl Config {
    /// Identity provider base URL; the store project hosts it unless
    /// overridden.
    pub fn auth_url(&self) -> &str {
        if self.auth.url.is_empty() {
            &self.store.url
        } else {
            &self.auth.url
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}

// ====== Config loading/saving ======

/// Load configuration from environment variables.
///
/// Priority:
/// 1. `CHATGATE_CONFIG` env var — full JSON config
/// 2. Individual env vars (merged on top of defaults)
/// 3. File fallback (`~/.chatgate/config.json`)
pub fn load_config_from_env() -> Config {
    // 1. Full JSON from CHATGATE_CONFIG
    if let Ok(json) = std::env::var("CHATGATE_CONFIG") {
        match serde_json::from_str::<Config>(&json) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("Failed to parse CHATGATE_CONFIG: {}", e);
            }
        }
    }

    // 2. Start with file fallback, then overlay individual env vars
    let mut cfg = load_config(None);

    // Store
    if let Ok(v) = std::env::var("SUPABASE_URL") {
        cfg.store.url = v;
    }
    if let Ok(v) = std::env::var("SUPABASE_SERVICE_KEY") {
        cfg.store.service_key = v;
    }
    if let Ok(v) = std::env::var("SUPABASE_AUTH_URL") {
        cfg.auth.url = v;
    }

    // Model
    if let Ok(v) = std::env::var("GOOGLE_API_KEY") {
        cfg.model.api_key = v;
    }
    if let Ok(v) = std::env::var("CHATGATE_MODEL") {
        cfg.model.model = v;
    }
    if let Ok(v) = std::env::var("CHATGATE_SYSTEM_INSTRUCTION") {
        cfg.model.system_instruction = Some(v);
    }

    // Gateway
    if let Ok(v) = std::env::var("PORT") {
        match v.parse() {
            Ok(port) => cfg.gateway.port = port,
            Err(_) => tracing::warn!("Ignoring unparseable PORT value: {}", v),
        }
    }
    if let Ok(v) = std::env::var("CHATGATE_ALLOWED_ORIGINS") {
        cfg.gateway.allowed_origins = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    cfg
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatgate")
        .join("config.json")
}

/// Get the chatgate data directory.
pub fn get_data_dir() -> PathBuf {
    let path = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatgate");
    std::fs::create_dir_all(&path).ok();
    path
}

/// Load configuration from file or create default.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if path.exists() {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config from {}: {}", path.display(), e);
                    tracing::warn!("Using default configuration.");
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config from {}: {}", path.display(), e);
                tracing::warn!("Using default configuration.");
            }
        }
    }

    Config::default()
}

/// Save configuration to file.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> std::result::Result<(), ConfigError> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(())
}
