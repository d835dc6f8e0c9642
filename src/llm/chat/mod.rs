pub mod groq;

use async_trait::async_trait;
use futures::{ Future, Stream };
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{ LlmConfig, LlmError };
use crate::models::chat::ChatMessage;
use self::groq::GroqChatClient;

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Runs a completion over the whole conversation and returns the finished text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;

    /// Starts a streamed completion. The returned stream yields text deltas and
    /// ends when the model signals completion. Once `cancel` fires the stream
    /// yields `LlmError::Cancelled` and stops reading from the provider.
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        cancel: CancellationToken
    ) -> Result<DeltaStream, LlmError>;

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> Option<String>;
}

/// Spawns `response_fn` as a producer task and hands back the receiving half
/// as a stream. The stream ends when the producer drops its sender.
pub fn create_streaming_response<T, F, Fut>(
    buffer: usize,
    response_fn: F
) -> Pin<Box<dyn Stream<Item = T> + Send>>
where
    T: Send + 'static,
    F: FnOnce(mpsc::Sender<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, LlmError> {
    let client = GroqChatClient::from_config(config)?;
    Ok(Arc::new(client))
}
