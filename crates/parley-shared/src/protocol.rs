use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{ChatId, MessageId, UserId};

/// Events a client sends over its socket, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Rebind this connection to a previously issued identity
    #[serde(rename = "reconnect", rename_all = "camelCase")]
    Reconnect { user_id: UserId },

    #[serde(rename = "setName")]
    SetName { name: String },

    /// Post a message into a chat the sender participates in
    #[serde(rename = "messageTo", rename_all = "camelCase")]
    MessageTo { chat_id: ChatId, text: String },

    /// Fetch a chat with its history (full unless `limit` is given)
    #[serde(rename = "getChat", alias = "getChatHistory", rename_all = "camelCase")]
    GetChat {
        chat_id: ChatId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// Find or create the chat whose participants are the named users plus the sender
    #[serde(rename = "getChatByNames")]
    GetChatByNames { names: Vec<String> },

    #[serde(rename = "getUserChats", alias = "getMyChats")]
    GetUserChats,

    #[serde(rename = "createEmptyChat")]
    CreateEmptyChat,

    #[serde(rename = "joinChatById", rename_all = "camelCase")]
    JoinChatById { chat_id: ChatId },

    /// Any `type` this server does not know about
    #[serde(other)]
    Unknown,
}

/// A parsed client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A JSON object without a `type` field
    Untyped,
    Event(ClientEvent),
}

impl Inbound {
    /// Parse one text frame.
    ///
    /// Unknown `type` values parse to [`ClientEvent::Unknown`]; a known
    /// `type` with missing or mistyped fields is a [`ProtocolError::Shape`].
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(ProtocolError::InvalidJson)?;

        let Some(object) = value.as_object() else {
            return Err(ProtocolError::NotAnObject);
        };

        let kind = match object.get("type") {
            None => return Ok(Inbound::Untyped),
            Some(serde_json::Value::String(kind)) => kind.clone(),
            Some(other) => other.to_string(),
        };

        serde_json::from_value(value)
            .map(Inbound::Event)
            .map_err(|source| ProtocolError::Shape { kind, source })
    }
}

/// A stored chat message as it appears in history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    /// Sender identity, or the `"AI"` sentinel
    pub from: UserId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A participant id together with its current display name, if known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: UserId,
    pub name: Option<String>,
}

/// One entry of a `userChats` listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub participants: Vec<ParticipantInfo>,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub last_message: Option<ChatMessage>,
}

/// Events the relay pushes to a client, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "welcome", rename_all = "camelCase")]
    Welcome { user_id: UserId, name: String },

    #[serde(rename = "aiChatCreated", rename_all = "camelCase")]
    AiChatCreated {
        chat_id: ChatId,
        participants: Vec<UserId>,
    },

    #[serde(rename = "emptyChatCreated", rename_all = "camelCase")]
    EmptyChatCreated {
        chat_id: ChatId,
        participants: Vec<UserId>,
    },

    #[serde(rename = "joinedChat", rename_all = "camelCase")]
    JoinedChat {
        chat_id: ChatId,
        participants: Vec<UserId>,
        created_at: DateTime<Utc>,
    },

    #[serde(rename = "participantJoined", rename_all = "camelCase")]
    ParticipantJoined {
        chat_id: ChatId,
        user_id: UserId,
        name: Option<String>,
    },

    #[serde(rename = "message", rename_all = "camelCase")]
    Message {
        chat_id: ChatId,
        message_id: MessageId,
        from: UserId,
        text: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "chat", rename_all = "camelCase")]
    Chat {
        chat_id: ChatId,
        participants: Vec<ParticipantInfo>,
        messages: Vec<ChatMessage>,
        created_at: DateTime<Utc>,
    },

    #[serde(rename = "userChats")]
    UserChats { chats: Vec<ChatSummary> },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "banned")]
    Banned { reason: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Wire name of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Welcome { .. } => "welcome",
            ServerEvent::AiChatCreated { .. } => "aiChatCreated",
            ServerEvent::EmptyChatCreated { .. } => "emptyChatCreated",
            ServerEvent::JoinedChat { .. } => "joinedChat",
            ServerEvent::ParticipantJoined { .. } => "participantJoined",
            ServerEvent::Message { .. } => "message",
            ServerEvent::Chat { .. } => "chat",
            ServerEvent::UserChats { .. } => "userChats",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Banned { .. } => "banned",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&ChatMessage> for ServerEvent {
    fn from(message: &ChatMessage) -> Self {
        ServerEvent::Message {
            chat_id: message.chat_id.clone(),
            message_id: message.id,
            from: message.from.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
        }
    }
}
