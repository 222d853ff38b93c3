//! The client's conversation collection and the single "currently streaming"
//! slot inside each conversation.
//!
//! Streams never hold a reference to the message they fill. A chunk is
//! applied to whatever message is last in the target conversation at that
//! moment, and only if that message is still an assistant reply, so a stale
//! stream can never overwrite a user message.

use crate::db::models::{Conversation, Message};
use crate::db::Database;
use crate::llm::{ChatMessage, Role};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub use crate::db::models::DEFAULT_TITLE;

pub const STORAGE_KEY: &str = "conversations";
pub const TITLE_MAX_CHARS: usize = 40;
pub const TITLE_ELLIPSIS: &str = "...";
pub const FALLBACK_REPLY: &str =
    "Sorry, I encountered an error. Please try again or contact TQL at (800) 304-1925.";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Message is empty")]
    EmptyMessage,
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
}

/// Change notifications for views observing the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    ConversationCreated { conversation_id: String },
    MessagesAppended { conversation_id: String },
    ContentUpdated { conversation_id: String, content: String },
    ConversationDeleted { conversation_id: String },
}

/// What a turn needs once its message pair has been appended.
#[derive(Debug, Clone)]
pub struct TurnDispatch {
    /// Captured at dispatch time; later selection changes do not retarget it.
    pub conversation_id: String,
    /// Prior messages plus the new user message, without the placeholder.
    pub history: Vec<ChatMessage>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct StoreState {
    conversations: Vec<Conversation>,
    active_id: Option<String>,
}

impl StoreState {
    fn find_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }
}

pub struct ConversationStore {
    db: Database,
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl ConversationStore {
    /// Load the whole collection once; later writes replace it wholesale.
    pub fn load(db: Database) -> Result<Self, StoreError> {
        let conversations: Vec<Conversation> = match db.load_blob(STORAGE_KEY)? {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        info!(count = conversations.len(), "Loaded conversations");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            db,
            state: Mutex::new(StoreState {
                conversations,
                active_id: None,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Display order: most recently created first.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().conversations.clone()
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn active_id(&self) -> Option<String> {
        self.state.lock().active_id.clone()
    }

    pub fn active(&self) -> Option<Conversation> {
        let state = self.state.lock();
        let id = state.active_id.as_deref()?;
        state.conversations.iter().find(|c| c.id == id).cloned()
    }

    pub fn select(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if !state.conversations.iter().any(|c| c.id == id) {
            return Err(StoreError::ConversationNotFound(id.to_string()));
        }
        state.active_id = Some(id.to_string());
        Ok(())
    }

    /// Create an empty conversation and make it the active one.
    pub fn new_conversation(&self) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new();
        self.commit(|state| {
            state.conversations.insert(0, conversation.clone());
            state.active_id = Some(conversation.id.clone());
            Ok(())
        })?;

        self.notify(StoreEvent::ConversationCreated {
            conversation_id: conversation.id.clone(),
        });
        Ok(conversation)
    }

    /// Append the user message and an empty assistant placeholder in one step.
    ///
    /// Targets the active conversation, creating one when nothing is active.
    /// The first exchange of a conversation also sets its title.
    pub fn send(&self, text: &str) -> Result<TurnDispatch, StoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::EmptyMessage);
        }

        let (conversation_id, created, history) = self.commit(|state| {
            let mut created = None;
            let active = state
                .active_id
                .clone()
                .filter(|id| state.conversations.iter().any(|c| &c.id == id));
            let conversation_id = match active {
                Some(id) => id,
                None => {
                    let conversation = Conversation::new();
                    let id = conversation.id.clone();
                    state.conversations.insert(0, conversation);
                    state.active_id = Some(id.clone());
                    created = Some(id.clone());
                    id
                }
            };

            let conversation = state
                .find_mut(&conversation_id)
                .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.clone()))?;

            if conversation.messages.is_empty() {
                conversation.title = derive_title(text);
            }

            let mut history: Vec<ChatMessage> =
                conversation.messages.iter().map(ChatMessage::from).collect();
            history.push(ChatMessage::user(text));

            conversation.messages.push(Message::new(Role::User, text));
            conversation.messages.push(Message::new(Role::Assistant, ""));
            conversation.touch();

            Ok((conversation_id, created, history))
        })?;

        if let Some(conversation_id) = created {
            self.notify(StoreEvent::ConversationCreated { conversation_id });
        }
        self.notify(StoreEvent::MessagesAppended {
            conversation_id: conversation_id.clone(),
        });
        debug!(conversation_id = %conversation_id, history = history.len(), "Turn dispatched");

        Ok(TurnDispatch {
            conversation_id,
            history,
        })
    }

    /// Replace the trailing assistant message's content with `accumulated`.
    ///
    /// Returns `Ok(false)` without touching anything when the conversation is
    /// gone or no longer ends with an assistant message.
    pub fn apply_chunk(&self, conversation_id: &str, accumulated: &str) -> Result<bool, StoreError> {
        self.set_trailing_content(conversation_id, accumulated)
    }

    /// Finalize a failed turn: an empty reply becomes the fallback apology,
    /// any partial reply is kept as the answer.
    pub fn apply_error(&self, conversation_id: &str, accumulated: &str) -> Result<bool, StoreError> {
        let content = if accumulated.is_empty() {
            FALLBACK_REPLY
        } else {
            accumulated
        };
        self.set_trailing_content(conversation_id, content)
    }

    /// Remove a conversation. Deleting the active one clears the selection.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self.commit(|state| {
            let before = state.conversations.len();
            state.conversations.retain(|c| c.id != id);
            if state.conversations.len() == before {
                return Ok(false);
            }
            if state.active_id.as_deref() == Some(id) {
                state.active_id = None;
            }
            Ok(true)
        })?;
        if !deleted {
            return Ok(false);
        }

        self.notify(StoreEvent::ConversationDeleted {
            conversation_id: id.to_string(),
        });
        Ok(true)
    }

    fn set_trailing_content(&self, conversation_id: &str, content: &str) -> Result<bool, StoreError> {
        let updated = self.commit(|state| {
            let Some(conversation) = state.find_mut(conversation_id) else {
                debug!(conversation_id, "Dropping update for a missing conversation");
                return Ok(false);
            };
            let Some(message) = conversation.trailing_assistant_mut() else {
                debug!(conversation_id, "Dropping update, last message is not an assistant reply");
                return Ok(false);
            };
            message.content = content.to_string();
            conversation.touch();
            Ok(true)
        })?;
        if !updated {
            return Ok(false);
        }

        self.notify(StoreEvent::ContentUpdated {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
        });
        Ok(true)
    }

    /// Apply `mutate` to a copy of the state. The copy replaces the live
    /// state only once it has been written; a failed `mutate` or a failed
    /// write leaves the store exactly as it was.
    fn commit<T>(
        &self,
        mutate: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let value = mutate(&mut next)?;
        if next != *state {
            self.persist(&next)?;
            *state = next;
        }
        Ok(value)
    }

    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let json = serde_json::to_string(&state.conversations)?;
        self.db.save_blob(STORAGE_KEY, &json)?;
        Ok(())
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Title for a conversation's first exchange: at most `TITLE_MAX_CHARS`
/// characters of the text, with an ellipsis only when something was cut.
pub fn derive_title(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= TITLE_MAX_CHARS {
        return text.to_string();
    }
    let mut title: String = text.chars().take(TITLE_MAX_CHARS).collect();
    title.push_str(TITLE_ELLIPSIS);
    title
}
