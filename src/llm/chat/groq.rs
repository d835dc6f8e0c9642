use async_trait::async_trait;
use futures::StreamExt;
use log::{ debug, info, warn };
use reqwest::{ Client as HttpClient, Response, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ create_streaming_response, ChatClient, DeltaStream };
use crate::llm::{ LlmConfig, LlmError };
use crate::models::chat::ChatMessage;

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODEL: &str = "llama3-8b-8192";
const COMPLETIONS_ROUTE: &str = "/chat/completions";
const STREAM_BUFFER: usize = 32;

pub struct GroqChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone)]
struct GroqMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct GroqRequest {
    messages: Vec<GroqMessage>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct GroqResponse {
    choices: Vec<GroqChoice>,
}

#[derive(Deserialize)]
struct GroqChoice {
    message: GroqMessage,
}

#[derive(Deserialize)]
struct GroqStreamResponse {
    #[serde(default)]
    choices: Vec<GroqStreamChoice>,
    error: Option<GroqApiError>,
}

#[derive(Deserialize)]
struct GroqStreamChoice {
    #[serde(default)]
    delta: GroqDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct GroqDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct GroqApiError {
    message: String,
}

/// What one line of the upstream event stream contributed.
#[derive(Debug, Default, PartialEq)]
struct StreamLine {
    delta: Option<String>,
    done: bool,
}

/// Reassembles lines from network chunks that may split a line (or a UTF-8
/// sequence) anywhere.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn parse_stream_line(line: &str) -> Result<StreamLine, LlmError> {
    let line = line.trim_end_matches('\r');
    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim_start(),
        // blank separators, comments and `event:` lines carry no text
        None => return Ok(StreamLine::default()),
    };

    if data == "[DONE]" {
        return Ok(StreamLine { delta: None, done: true });
    }

    let parsed: GroqStreamResponse = serde_json::from_str(data)?;
    if let Some(err) = parsed.error {
        return Err(LlmError::Provider(err.message));
    }

    let mut out = StreamLine::default();
    for choice in parsed.choices {
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            out.delta.get_or_insert_with(String::new).push_str(&content);
        }
        if choice.finish_reason.as_deref() == Some("stop") {
            out.done = true;
        }
    }
    Ok(out)
}

async fn check_status(resp: Response) -> Result<Response, LlmError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(LlmError::Status { status: status.as_u16(), body })
}

/// Forwards parsed deltas into `tx`. Returns `Ok(())` when the upstream
/// sequence completes or the receiver goes away.
async fn pump_stream(
    resp: Response,
    tx: &mpsc::Sender<Result<String, LlmError>>,
    cancel: &CancellationToken
) -> Result<(), LlmError> {
    let mut bytes = resp.bytes_stream();
    let mut lines = LineBuffer::default();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            _ = tx.closed() => {
                debug!("Groq stream receiver dropped");
                return Ok(());
            }
            chunk = bytes.next() => chunk,
        };

        let (batch, exhausted) = match chunk {
            Some(Ok(buf)) => (lines.push(&buf), false),
            Some(Err(e)) => return Err(LlmError::Http(e)),
            None => (lines.finish().into_iter().collect::<Vec<_>>(), true),
        };

        for line in batch {
            let parsed = parse_stream_line(&line)?;
            if let Some(delta) = parsed.delta {
                if tx.send(Ok(delta)).await.is_err() {
                    debug!("Groq stream receiver dropped");
                    return Ok(());
                }
            }
            if parsed.done {
                return Ok(());
            }
        }

        if exhausted {
            return Ok(());
        }
    }
}

impl GroqChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>
    ) -> Result<Self, LlmError> {
        let chat_model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let api_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| LlmError::Config(format!("Invalid API key format: {}", e)))?
        );

        let http = HttpClient::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            model: chat_model,
            base_url: api_url,
            temperature: None,
            max_tokens: None,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::Config("Groq API key is required".to_string()))?;

        let mut client = Self::new(
            api_key,
            config.completion_model.clone(),
            config.base_url.clone()
        )?;
        client.temperature = config.temperature;
        client.max_tokens = config.max_tokens;
        Ok(client)
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), COMPLETIONS_ROUTE)
    }

    fn request(&self, messages: &[ChatMessage], stream: bool) -> GroqRequest {
        GroqRequest {
            messages: messages
                .iter()
                .map(|m| GroqMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: stream.then_some(true),
        }
    }
}

#[async_trait]
impl ChatClient for GroqChatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let req = self.request(messages, false);

        let resp = self.http.post(self.url()).json(&req).send().await?;
        let resp = check_status(resp).await?.json::<GroqResponse>().await?;

        resp.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(LlmError::EmptyResponse)
    }

    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        cancel: CancellationToken
    ) -> Result<DeltaStream, LlmError> {
        let url = self.url();
        let req = self.request(messages, true);
        let client = self.http.clone();

        info!("Starting Groq stream request to {}", url);

        Ok(
            create_streaming_response(STREAM_BUFFER, move |tx| async move {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(LlmError::Cancelled),
                    resp = client.post(&url).json(&req).send() => resp.map_err(LlmError::from),
                };

                let result = match sent {
                    Ok(resp) => {
                        match check_status(resp).await {
                            Ok(resp) => pump_stream(resp, &tx, &cancel).await,
                            Err(e) => Err(e),
                        }
                    }
                    Err(e) => Err(e),
                };

                if let Err(e) = result {
                    if !matches!(e, LlmError::Cancelled) {
                        warn!("Groq stream error: {}", e);
                    }
                    let _ = tx.send(Err(e)).await;
                }
            })
        )
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}
