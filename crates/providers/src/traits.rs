use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("request failed with status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("provider request timed out after {0}s")]
    Timeout(u64),
}

/// A single completion call. The planners only ever send one user prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    pub timeout_seconds: u64,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>, timeout_seconds: u64) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            timeout_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ProviderError>;

    fn name(&self) -> &str;
}
