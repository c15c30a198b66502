//! Domain model structs held by the registry and the chat store.
//!
//! The listing types derive `Serialize` so the admin API can return them
//! as-is.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use parley_shared::{ChatId, ChatMessage, Transport, UserId};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A registered participant.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: UserId,
    /// Live connection, `None` while disconnected or after a ban.
    pub transport: Option<Transport>,
    pub name: String,
    /// Network address the identity was first seen from.
    pub address: String,
}

impl Identity {
    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_open)
    }

    pub fn info(&self) -> IdentityInfo {
        IdentityInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            connected: self.is_connected(),
        }
    }
}

/// Admin-facing view of an [`Identity`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IdentityInfo {
    pub id: UserId,
    pub name: String,
    pub address: String,
    pub connected: bool,
}

/// Outcome of [`SessionRegistry::register`](crate::SessionRegistry::register).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub user_id: UserId,
    pub name: String,
    /// `true` when an identity already owned the address and was rebound.
    pub reconnected: bool,
}

/// A banned address together with the identities registered from it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BannedAddress {
    pub address: String,
    pub owners: Vec<IdentityInfo>,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A conversation with an ordered, duplicate-free participant list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub participants: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    pub fn has_ai(&self) -> bool {
        self.participants.iter().any(UserId::is_ai)
    }

    /// Participants as a set, for order-independent comparison.
    pub fn participant_set(&self) -> BTreeSet<&UserId> {
        self.participants.iter().collect()
    }
}

/// Debug listing of every chat and message log.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSnapshot {
    pub chats: Vec<Chat>,
    pub messages: BTreeMap<ChatId, Vec<ChatMessage>>,
}
