//! Conversation persistence
//!
//! Conversations are owned by a session id; every lookup is keyed by both,
//! so one session can never read or delete another's conversations. The
//! route layer talks to the store through [`ConversationStore`]; the relay
//! itself never does.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::chat::Role;

/// Title given to conversations created without one.
pub const DEFAULT_TITLE: &str = "New conversation";

const MAX_TITLE_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    /// Unix seconds.
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Keyed record store for conversations and their messages.
///
/// Uses `Pin<Box<dyn Future>>` return types so it can be held as
/// `Arc<dyn ConversationStore>`.
pub trait ConversationStore: Send + Sync {
    fn create<'a>(&'a self, session: &'a str, title: Option<&'a str>)
    -> StoreFuture<'a, Conversation>;

    /// Newest first.
    fn list<'a>(&'a self, session: &'a str) -> StoreFuture<'a, Vec<Conversation>>;

    fn append<'a>(
        &'a self,
        session: &'a str,
        id: &'a str,
        role: Role,
        content: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// Oldest first.
    fn messages<'a>(&'a self, session: &'a str, id: &'a str)
    -> StoreFuture<'a, Vec<StoredMessage>>;

    fn delete<'a>(&'a self, session: &'a str, id: &'a str) -> StoreFuture<'a, ()>;
}

#[derive(Debug)]
struct ConversationRecord {
    conversation: Conversation,
    messages: Vec<StoredMessage>,
}

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    /// Session id → conversations in creation order.
    sessions: RwLock<HashMap<String, Vec<ConversationRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn normalize_title(title: Option<&str>) -> String {
    match title.map(str::trim) {
        Some(t) if !t.is_empty() => t.chars().take(MAX_TITLE_CHARS).collect(),
        _ => DEFAULT_TITLE.to_string(),
    }
}

impl ConversationStore for InMemoryStore {
    fn create<'a>(
        &'a self,
        session: &'a str,
        title: Option<&'a str>,
    ) -> StoreFuture<'a, Conversation> {
        Box::pin(async move {
            let conversation = Conversation {
                id: uuid::Uuid::new_v4().to_string(),
                title: normalize_title(title),
                created_at: unix_now(),
            };
            self.sessions
                .write()
                .await
                .entry(session.to_string())
                .or_default()
                .push(ConversationRecord {
                    conversation: conversation.clone(),
                    messages: Vec::new(),
                });
            Ok(conversation)
        })
    }

    fn list<'a>(&'a self, session: &'a str) -> StoreFuture<'a, Vec<Conversation>> {
        Box::pin(async move {
            let sessions = self.sessions.read().await;
            Ok(sessions
                .get(session)
                .map(|records| {
                    records
                        .iter()
                        .rev()
                        .map(|r| r.conversation.clone())
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn append<'a>(
        &'a self,
        session: &'a str,
        id: &'a str,
        role: Role,
        content: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            let record = sessions
                .get_mut(session)
                .and_then(|records| records.iter_mut().find(|r| r.conversation.id == id))
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            record.messages.push(StoredMessage {
                role,
                content: content.to_string(),
                created_at: unix_now(),
            });
            Ok(())
        })
    }

    fn messages<'a>(
        &'a self,
        session: &'a str,
        id: &'a str,
    ) -> StoreFuture<'a, Vec<StoredMessage>> {
        Box::pin(async move {
            let sessions = self.sessions.read().await;
            sessions
                .get(session)
                .and_then(|records| records.iter().find(|r| r.conversation.id == id))
                .map(|r| r.messages.clone())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })
    }

    fn delete<'a>(&'a self, session: &'a str, id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            let records = sessions
                .get_mut(session)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let before = records.len();
            records.retain(|r| r.conversation.id != id);
            if records.len() == before {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }
}
