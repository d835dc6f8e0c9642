pub mod chat;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("upstream request cancelled")]
    Cancelled,
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned status {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("upstream provider error: {0}")]
    Provider(String),
    #[error("malformed upstream payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("upstream returned no choices")]
    EmptyResponse,
    #[error("invalid LLM configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub completion_model: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}
