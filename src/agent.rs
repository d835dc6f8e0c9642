use crate::history::HistoryStore;
use crate::llm::LlmError;
use crate::llm::chat::{ create_streaming_response, ChatClient, DeltaStream };
use crate::models::chat::{ ChatMessage, Conversation };

use futures::{ Stream, StreamExt };
use log::{ debug, error, info, warn };
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{ mpsc, Mutex as AsyncMutex, OwnedMutexGuard };
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const RELAY_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("request aborted")]
    Cancelled,
    #[error(transparent)]
    Upstream(LlmError),
    #[error("no pending request to stop")]
    NotFound,
}

impl From<LlmError> for RelayError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => RelayError::Cancelled,
            other => RelayError::Upstream(other),
        }
    }
}

/// Fragments of one streamed turn. A trailing `Err` reports how the turn
/// ended when it did not complete normally.
pub type RelayStream = Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>;

#[derive(Clone, Debug, Default)]
pub struct RelayOptions {
    pub system_prompt: Option<String>,
    /// Pause after each relayed fragment.
    pub stream_delay: Duration,
}

struct PendingRequest {
    id: Uuid,
    token: CancellationToken,
}

#[derive(Default)]
struct PendingRegistry {
    requests: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fresh token for `user_id`, cancelling whatever was there.
    fn register(self: &Arc<Self>, user_id: &str) -> PendingGuard {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let previous = self.lock().insert(user_id.to_string(), PendingRequest {
            id,
            token: token.clone(),
        });

        if let Some(previous) = previous {
            warn!("User {} started a new request while one was in flight; cancelling the old one", user_id);
            previous.token.cancel();
        }

        PendingGuard {
            registry: Arc::clone(self),
            user_id: user_id.to_string(),
            id,
            token,
        }
    }

    fn cancel(&self, user_id: &str) -> bool {
        let removed = self.lock().remove(user_id);
        match removed {
            Some(request) => {
                request.token.cancel();
                true
            }
            None => false,
        }
    }

    fn release(&self, user_id: &str, id: Uuid) {
        let mut requests = self.lock();
        if requests.get(user_id).map(|r| r.id) == Some(id) {
            requests.remove(user_id);
        }
    }

    fn contains(&self, user_id: &str) -> bool {
        self.lock().contains_key(user_id)
    }
}

/// Removes its registry entry on drop, unless a newer request replaced it.
struct PendingGuard {
    registry: Arc<PendingRegistry>,
    user_id: String,
    id: Uuid,
    token: CancellationToken,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry.release(&self.user_id, self.id);
    }
}

/// Per-user turn mutexes. An entry lives only while some turn holds or
/// waits on it.
#[derive(Default)]
struct TurnLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TurnLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.map().entry(user_id.to_string()).or_default())
    }

    fn prune(&self, user_id: &str) {
        let mut locks = self.map();
        if locks.get(user_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(user_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

struct TurnGuard {
    locks: Arc<TurnLocks>,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.prune(&self.user_id);
    }
}

/// Everything a turn holds while it talks to the upstream model.
struct Turn {
    pending: PendingGuard,
    _lock: TurnGuard,
    messages: Vec<ChatMessage>,
}

enum RelayOutcome {
    Completed(String),
    Cancelled,
    Disconnected,
    Failed(LlmError),
}

pub struct RelayAgent {
    chat_client: Arc<dyn ChatClient>,
    history_store: Arc<dyn HistoryStore>,
    pending: Arc<PendingRegistry>,
    turn_locks: Arc<TurnLocks>,
    options: RelayOptions,
}

impl RelayAgent {
    pub fn new(
        chat_client: Arc<dyn ChatClient>,
        history_store: Arc<dyn HistoryStore>,
        options: RelayOptions
    ) -> Self {
        Self {
            chat_client,
            history_store,
            pending: Arc::new(PendingRegistry::default()),
            turn_locks: Arc::new(TurnLocks::default()),
            options,
        }
    }

    fn upstream_messages(&self, history: Vec<ChatMessage>) -> Vec<ChatMessage> {
        match self.options.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            Some(prompt) => {
                let mut messages = Vec::with_capacity(history.len() + 1);
                messages.push(ChatMessage::system(prompt));
                messages.extend(history);
                messages
            }
            None => history,
        }
    }

    async fn begin_turn(&self, user_id: &str, message: &str) -> Result<Turn, RelayError> {
        let pending = self.pending.register(user_id);
        let turn_lock = self.turn_locks.get(user_id);

        let acquired = tokio::select! {
            biased;
            _ = pending.token.cancelled() => None,
            lock = turn_lock.lock_owned() => Some(lock),
        };
        let Some(guard) = acquired else {
            self.turn_locks.prune(user_id);
            info!("Request for {} cancelled before it started", user_id);
            return Err(RelayError::Cancelled);
        };
        let lock = TurnGuard {
            locks: Arc::clone(&self.turn_locks),
            user_id: user_id.to_string(),
            guard: Some(guard),
        };

        self.history_store.add_message(user_id, ChatMessage::user(message)).await;
        let conversation = self.history_store.get_conversation(user_id).await;

        Ok(Turn {
            pending,
            _lock: lock,
            messages: self.upstream_messages(conversation.messages),
        })
    }

    /// Runs one turn without streaming and returns the assistant reply.
    pub async fn process_message(&self, user_id: &str, message: &str) -> Result<String, RelayError> {
        let turn = self.begin_turn(user_id, message).await?;

        let result = tokio::select! {
            biased;
            _ = turn.pending.token.cancelled() => Err(LlmError::Cancelled),
            result = self.chat_client.complete(&turn.messages) => result,
        };

        match result {
            Ok(reply) => {
                self.history_store.add_message(user_id, ChatMessage::assistant(reply.clone())).await;
                Ok(reply)
            }
            Err(LlmError::Cancelled) => {
                info!("Request aborted for {}", user_id);
                Err(RelayError::Cancelled)
            }
            Err(e) => {
                error!("LLM interaction error for {}: {}", user_id, e);
                Err(RelayError::Upstream(e))
            }
        }
    }

    /// Starts one streamed turn. Fragments are relayed by a background task
    /// that owns the turn until the upstream sequence ends, fails, is stopped
    /// or the returned stream is dropped.
    pub async fn process_message_stream(
        &self,
        user_id: &str,
        message: &str
    ) -> Result<RelayStream, RelayError> {
        let turn = self.begin_turn(user_id, message).await?;
        let token = turn.pending.token.clone();

        let deltas = tokio::select! {
            biased;
            _ = token.cancelled() => Err(LlmError::Cancelled),
            deltas = self.chat_client.stream_completion(&turn.messages, token.clone()) => deltas,
        };
        let deltas = deltas.map_err(|e| {
            if !matches!(e, LlmError::Cancelled) {
                error!("Failed to start upstream stream for {}: {}", user_id, e);
            }
            RelayError::from(e)
        })?;

        let history_store = Arc::clone(&self.history_store);
        let user_id = user_id.to_string();
        let delay = self.options.stream_delay;

        Ok(
            create_streaming_response(RELAY_BUFFER, move |tx| async move {
                let outcome = relay_deltas(deltas, &tx, &token, delay).await;

                let terminal = match outcome {
                    RelayOutcome::Completed(reply) => {
                        history_store.add_message(&user_id, ChatMessage::assistant(reply)).await;
                        None
                    }
                    RelayOutcome::Cancelled => {
                        info!("Streaming stopped by user {}", user_id);
                        Some(RelayError::Cancelled)
                    }
                    RelayOutcome::Disconnected => {
                        info!("Client for {} went away mid-stream", user_id);
                        None
                    }
                    RelayOutcome::Failed(e) => {
                        error!("Upstream stream failed for {}: {}", user_id, e);
                        Some(RelayError::Upstream(e))
                    }
                };

                // release the registry entry and the turn lock before waiting on the client
                drop(turn);

                if let Some(err) = terminal {
                    let _ = tx.send(Err(err)).await;
                }
            })
        )
    }

    /// Signals the in-flight request for `user_id`, if any.
    pub fn stop(&self, user_id: &str) -> Result<(), RelayError> {
        if self.pending.cancel(user_id) {
            info!("Stop requested for {}", user_id);
            Ok(())
        } else {
            debug!("Stop requested for {} with nothing in flight", user_id);
            Err(RelayError::NotFound)
        }
    }

    pub fn is_pending(&self, user_id: &str) -> bool {
        self.pending.contains(user_id)
    }

    pub async fn conversation(&self, user_id: &str) -> Conversation {
        self.history_store.get_conversation(user_id).await
    }
}

async fn relay_deltas(
    mut deltas: DeltaStream,
    tx: &mpsc::Sender<Result<String, RelayError>>,
    cancel: &CancellationToken,
    delay: Duration
) -> RelayOutcome {
    let mut reply = String::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayOutcome::Cancelled,
            _ = tx.closed() => return RelayOutcome::Disconnected,
            next = deltas.next() => next,
        };

        let fragment = match next {
            Some(Ok(fragment)) => fragment,
            Some(Err(LlmError::Cancelled)) => return RelayOutcome::Cancelled,
            Some(Err(e)) => return RelayOutcome::Failed(e),
            None => return RelayOutcome::Completed(reply),
        };

        if cancel.is_cancelled() {
            return RelayOutcome::Cancelled;
        }

        reply.push_str(&fragment);
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayOutcome::Cancelled,
            sent = tx.send(Ok(fragment)) => sent,
        };
        if sent.is_err() {
            return RelayOutcome::Disconnected;
        }

        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayOutcome::Cancelled,
                _ = tx.closed() => return RelayOutcome::Disconnected,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
