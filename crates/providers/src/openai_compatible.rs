use crate::traits::*;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

pub struct OpenAICompatibleProvider {
    client: Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAICompatibleProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Pulls the assistant text out of a chat-completions response body.
pub fn parse_completion(json: &serde_json::Value) -> Result<String, ProviderError> {
    let choice = json["choices"]
        .get(0)
        .ok_or_else(|| ProviderError::Parse("No choices in response".to_string()))?;

    let content = choice["message"]["content"]
        .as_str()
        .or_else(|| choice["text"].as_str())
        .ok_or_else(|| ProviderError::Parse("No content in first choice".to_string()))?;

    Ok(content.to_string())
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = json!({
            "model": request.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": 0,
        });

        let mut builder = self.client.post(&url).json(&body);
        if request.timeout_seconds > 0 {
            builder = builder.timeout(Duration::from_secs(request.timeout_seconds));
        }
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        tracing::debug!("POST {} model={}", url, request.model);

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(request.timeout_seconds)
            } else {
                ProviderError::Http(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(GenerateResponse {
            text: parse_completion(&json)?,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
