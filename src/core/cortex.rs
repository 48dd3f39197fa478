use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use tracing::warn;

use super::state::SynapseConfig;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    /// Gemini calls the assistant side `model`.
    fn gemini_role(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Single-shot chat completion.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String>;
}

pub struct GeminiCortex {
    api_key: String,
    client: reqwest::Client,
    primary_model: String,
    fallback_model: String,
    base_url: String,
}

impl GeminiCortex {
    pub fn new(config: &SynapseConfig) -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY not found in .env or environment")?;

        Ok(Self {
            api_key,
            client: reqwest::Client::new(),
            primary_model: config.primary_model.clone(),
            fallback_model: config.fallback_model.clone(),
            base_url: GEMINI_BASE_URL.to_string(),
        })
    }

    async fn generate(&self, model: &str, payload: &Value) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(payload)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let err_text = res.text().await.unwrap_or_default();
            return Err(anyhow!("{} failed. Status: {}, Body: {}", model, status, err_text));
        }

        let body: Value = res.json().await?;
        extract_text(&body).with_context(|| format!("{} response parsing failed", model))
    }
}

pub fn build_payload(system: &str, messages: &[ChatMessage], max_tokens: u32) -> Value {
    let contents: Vec<Value> = messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role.gemini_role(),
                "parts": [{ "text": m.content }]
            })
        })
        .collect();

    json!({
        "systemInstruction": {
            "parts": [{ "text": system }]
        },
        "contents": contents,
        "generationConfig": { "maxOutputTokens": max_tokens }
    })
}

#[async_trait]
impl LanguageModel for GeminiCortex {
    async fn complete(
        &self,
        system: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String> {
        let payload = build_payload(system, messages, max_tokens);

        match self.generate(&self.primary_model, &payload).await {
            Ok(text) => return Ok(text),
            Err(e) => warn!(
                model = %self.primary_model,
                error = %e,
                "primary model failed, switching to fallback"
            ),
        }

        self.generate(&self.fallback_model, &payload).await
    }
}

/// Concatenates every text part of the first candidate.
fn extract_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
