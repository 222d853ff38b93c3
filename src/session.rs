//! Per-turn state machine tying the stream consumer to the store:
//! `Sending -> Streaming -> {Done | Failed | Cancelled}`.

use crate::client::{RelayClient, StreamEvent};
use crate::store::{ConversationStore, StoreError};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Done,
    Failed,
    Cancelled,
}

/// Handle to one dispatched turn. Each turn owns its own cancellation token.
pub struct TurnHandle {
    conversation_id: String,
    cancel: CancellationToken,
    task: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Idempotent; content received so far stays as it is.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> TurnOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, conversation_id = %self.conversation_id, "Turn task failed");
                TurnOutcome::Failed
            }
        }
    }
}

pub struct ChatSession {
    store: Arc<ConversationStore>,
    client: RelayClient,
    system_prompt: Option<String>,
}

impl ChatSession {
    pub fn new(store: Arc<ConversationStore>, client: RelayClient) -> Self {
        Self {
            store,
            client,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Append the message pair and start streaming the reply in the
    /// background. Must be called from within a Tokio runtime.
    pub fn send(&self, text: &str) -> Result<TurnHandle, StoreError> {
        let dispatch = self.store.send(text)?;
        let cancel = CancellationToken::new();
        let events =
            self.client
                .stream_chat(dispatch.history, self.system_prompt.clone(), cancel.clone());

        let store = Arc::clone(&self.store);
        let conversation_id = dispatch.conversation_id;
        let target = conversation_id.clone();
        let task = tokio::spawn(async move { drive_turn(&store, &target, events).await });

        Ok(TurnHandle {
            conversation_id,
            cancel,
            task,
        })
    }
}

/// Feed a turn's events into the store until the stream ends.
///
/// A stream that ends without a terminal event was cancelled; whatever was
/// already applied is left in place.
pub async fn drive_turn<S>(store: &ConversationStore, conversation_id: &str, events: S) -> TurnOutcome
where
    S: Stream<Item = StreamEvent>,
{
    let mut events = std::pin::pin!(events);
    let mut accumulated = String::new();

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Chunk(text) => {
                accumulated.push_str(&text);
                if let Err(err) = store.apply_chunk(conversation_id, &accumulated) {
                    warn!(error = %err, conversation_id, "Failed to persist chunk");
                }
            }
            StreamEvent::Done => {
                info!(conversation_id, chars = accumulated.chars().count(), "Turn complete");
                return TurnOutcome::Done;
            }
            StreamEvent::Error(err) => {
                warn!(error = %err, conversation_id, received = accumulated.len(), "Turn failed");
                if let Err(err) = store.apply_error(conversation_id, &accumulated) {
                    warn!(error = %err, conversation_id, "Failed to persist error reply");
                }
                return TurnOutcome::Failed;
            }
        }
    }

    info!(conversation_id, "Turn cancelled");
    TurnOutcome::Cancelled
}
