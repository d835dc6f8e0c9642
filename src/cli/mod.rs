use clap::Parser;
use std::time::Duration;
use crate::agent::RelayOptions;
use crate::llm::LlmConfig;
use crate::llm::chat::groq::DEFAULT_MODEL;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful and friendly assistant. Your task is to assist the user in a variety of conversations and provide accurate, thoughtful responses.";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Chat LLM Provider Args ---
    /// API Key for the Groq chat completion API
    #[arg(long, env = "GROQ_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Base URL of the OpenAI-compatible API (e.g., https://api.groq.com/openai/v1)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, the client falls back to Groq
    pub chat_base_url: Option<String>,

    /// Model name for chat completion
    #[arg(long, env = "CHAT_MODEL", default_value = DEFAULT_MODEL)]
    pub chat_model: String,

    /// Sampling temperature sent upstream. Provider default when unset.
    #[arg(long, env = "CHAT_TEMPERATURE")]
    pub chat_temperature: Option<f32>,

    /// Upper bound on generated tokens per reply. Provider default when unset.
    #[arg(long, env = "CHAT_MAX_TOKENS")]
    pub chat_max_tokens: Option<u32>,

    /// System instruction sent ahead of every conversation. Empty disables it.
    #[arg(long, env = "SYSTEM_PROMPT", default_value = DEFAULT_SYSTEM_PROMPT)]
    pub system_prompt: String,

    /// Delay in milliseconds after each streamed fragment.
    #[arg(long, env = "STREAM_DELAY_MS", default_value = "20")]
    pub stream_delay_ms: u64,

    // --- Server Args ---
    /// Host address for the HTTP server to listen on.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the HTTP server to listen on.
    #[arg(short = 'p', long, env = "PORT", default_value = "5000")]
    pub port: u16,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

impl Args {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            api_key: Some(self.api_key.clone()).filter(|k| !k.is_empty()),
            completion_model: Some(self.chat_model.clone()),
            base_url: self.chat_base_url.clone(),
            temperature: self.chat_temperature,
            max_tokens: self.chat_max_tokens,
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            system_prompt: Some(self.system_prompt.clone()).filter(|p| !p.trim().is_empty()),
            stream_delay: Duration::from_millis(self.stream_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["chat-relay", "--api-key", "gsk_test", "--port", "5000"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn builds_llm_config_from_flags() {
        let args = parse(&["--chat-model", "llama3-70b-8192", "--chat-max-tokens", "150"]);
        let config = args.llm_config();
        assert_eq!(config.api_key.as_deref(), Some("gsk_test"));
        assert_eq!(config.completion_model.as_deref(), Some("llama3-70b-8192"));
        assert_eq!(config.max_tokens, Some(150));
        assert!(args.server_addr().ends_with(":5000"));
    }

    #[test]
    fn blank_system_prompt_disables_it() {
        let args = parse(&["--system-prompt", " ", "--stream-delay-ms", "0"]);
        let options = args.relay_options();
        assert!(options.system_prompt.is_none());
        assert!(options.stream_delay.is_zero());
    }
}
