use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::error::{ConfigError, ProviderError};
use crate::types::Turn;
use crate::util::http;

use super::GenerativeModel;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini API provider.
pub struct GeminiProvider {
    api_key: String,
    api_base: String,
    model: String,
    max_output_tokens: u32,
    temperature: f64,
}

impl GeminiProvider {
    pub fn new(cfg: &ModelConfig) -> Result<Self, ConfigError> {
        if cfg.api_key.is_empty() {
            return Err(ConfigError::NoApiKey);
        }
        let base = cfg
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Ok(Self {
            api_key: cfg.api_key.clone(),
            api_base: base.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            max_output_tokens: cfg.max_output_tokens,
            temperature: cfg.temperature,
        })
    }

    /// Convert turns to Gemini `contents` format.
    fn convert_turns(&self, turns: &[Turn]) -> Vec<serde_json::Value> {
        turns
            .iter()
            .map(|turn| {
                json!({
                    "role": turn.role.as_str(),
                    "parts": [{"text": turn.text}],
                })
            })
            .collect()
    }

    async fn request(
        &self,
        contents: &[serde_json::Value],
        system_instruction: Option<&str>,
    ) -> Result<String, ProviderError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, self.model, self.api_key
        );

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": self.max_output_tokens,
                "temperature": self.temperature,
            },
        });

        if let Some(instruction) = system_instruction {
            body["systemInstruction"] = json!({
                "parts": [{"text": instruction}]
            });
        }

        debug!("Gemini request with model {}", self.model);

        let response = http::client()
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let data: serde_json::Value = response.json().await?;
        parse_response(&data)
    }
}

#[async_trait]
impl GenerativeModel for GeminiProvider {
    async fn generate(
        &self,
        turns: &[Turn],
        system_instruction: Option<&str>,
    ) -> Result<String, ProviderError> {
        let contents = self.convert_turns(turns);

        match self.request(&contents, system_instruction).await {
            Ok(text) => Ok(text),
            // A rejected system instruction should not sink the whole
            // request; retry the turn without it.
            Err(e) if system_instruction.is_some() => {
                warn!("Generation with system instruction failed ({}), retrying without", e);
                self.request(&contents, None).await
            }
            Err(e) => Err(e),
        }
    }
}

fn parse_response(data: &serde_json::Value) -> Result<String, ProviderError> {
    let parts = data
        .get("candidates")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("content"))
        .and_then(|v| v.get("parts"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| ProviderError::Parse("No candidates in response".to_string()))?;

    let mut text = String::new();
    for part in parts {
        if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
            text.push_str(t);
        }
    }

    if text.is_empty() {
        return Err(ProviderError::Parse("Empty text in response".to_string()));
    }
    Ok(text)
}
