use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{json, Value};

use warden_core::config::{JudgeConfig, JudgeConfigHandle, LlmProvider};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One judge call: a system prompt, a user prompt and the sampling settings in force.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}

/// Chat client for OpenAI-compatible (`openai`, `ollama`) and Anthropic message APIs.
///
/// Provider, endpoint and credentials are read from the shared handle on every call.
pub struct HttpChatClient {
    http: reqwest::Client,
    judge: JudgeConfigHandle,
}

impl HttpChatClient {
    pub fn new(judge: JudgeConfigHandle) -> Self {
        Self { http: reqwest::Client::new(), judge }
    }

    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &Value,
    ) -> Result<Value> {
        let mut request = self.http.post(url).header("Content-Type", "application/json");
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = request.json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            bail!("judge API error (status {status}): {error_text}");
        }
        Ok(response.json().await?)
    }

    async fn complete_openai(&self, config: &JudgeConfig, request: &ChatRequest) -> Result<String> {
        let url = format!("{}/v1/chat/completions", base_url(config));
        let mut headers = Vec::new();
        if let Some(key) = &config.api_key {
            headers.push(("Authorization", format!("Bearer {}", key.expose_secret())));
        }

        let body = json!({
            "model": request.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let json = self.post_json(&url, &headers, &body).await?;
        json.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("judge response missing choices[0].message.content"))
    }

    async fn complete_anthropic(
        &self,
        config: &JudgeConfig,
        request: &ChatRequest,
    ) -> Result<String> {
        let url = format!("{}/v1/messages", base_url(config));
        let key = config
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow!("anthropic judge requires judge.api_key"))?;
        let headers = vec![
            ("x-api-key", key.expose_secret().to_string()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ];

        let body = json!({
            "model": request.model,
            "system": request.system,
            "messages": [{ "role": "user", "content": request.user }],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let json = self.post_json(&url, &headers, &body).await?;
        let text = json
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            bail!("judge response contained no text blocks");
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmClient for HttpChatClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let config = self.judge.snapshot();
        match config.provider {
            LlmProvider::OpenAi | LlmProvider::Ollama => {
                self.complete_openai(&config, request).await
            }
            LlmProvider::Anthropic => self.complete_anthropic(&config, request).await,
        }
    }
}

fn base_url(config: &JudgeConfig) -> String {
    let default = match config.provider {
        LlmProvider::OpenAi => "https://api.openai.com",
        LlmProvider::Anthropic => "https://api.anthropic.com",
        LlmProvider::Ollama => "http://localhost:11434",
    };
    config.base_url.as_deref().unwrap_or(default).trim_end_matches('/').to_string()
}
