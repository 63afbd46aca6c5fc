//! Inbound chat exchange and upstream message assembly

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Speaker of a prior turn supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    #[serde(default, rename = "conversationId", alias = "conversation_id")]
    pub conversation_id: Option<String>,
}

/// One entry of the upstream `messages` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatRequest {
    /// Parse and validate a raw request body.
    ///
    /// Runs before any key is selected, so a rejected request never touches
    /// the pool or upstream.
    pub fn from_body(body: &[u8], max_message_chars: usize) -> Result<Self, RelayError> {
        let request: ChatRequest = serde_json::from_slice(body)
            .map_err(|e| RelayError::InvalidRequest(format!("malformed chat request: {e}")))?;
        request.validate(max_message_chars)?;
        Ok(request)
    }

    pub fn validate(&self, max_message_chars: usize) -> Result<(), RelayError> {
        if self.message.trim().is_empty() {
            return Err(RelayError::InvalidRequest(
                "message must not be empty".into(),
            ));
        }
        let chars = self.message.chars().count();
        if chars > max_message_chars {
            return Err(RelayError::InvalidRequest(format!(
                "message is {chars} characters, limit is {max_message_chars}"
            )));
        }
        if let Some(id) = &self.conversation_id
            && id.trim().is_empty()
        {
            return Err(RelayError::InvalidRequest(
                "conversationId must not be blank".into(),
            ));
        }
        Ok(())
    }
}

/// `[system directive] ++ history ++ [new user message]`, order preserved.
pub fn build_messages(system_prompt: &str, request: &ChatRequest) -> Vec<UpstreamMessage> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    messages.push(UpstreamMessage {
        role: "system",
        content: system_prompt.to_string(),
    });
    messages.extend(request.history.iter().map(|turn| UpstreamMessage {
        role: turn.role.as_str(),
        content: turn.content.clone(),
    }));
    messages.push(UpstreamMessage {
        role: Role::User.as_str(),
        content: request.message.clone(),
    });
    messages
}
