//! Chat membership and message logs.
//!
//! Chats are addressed two ways: a short numeric code that users share to
//! join by hand, and, for chats looked up by their exact participant set, a
//! BLAKE3-derived token. Message logs are append-only and ordered by
//! insertion, never by timestamp.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use rand::Rng;
use tracing::debug;

use parley_shared::constants::{
    DEFAULT_CHAT_ID_DIGITS, DEFAULT_HISTORY_LIMIT, DERIVED_CHAT_ID_LEN, MAX_CHAT_ID_DIGITS,
};
use parley_shared::{ChatId, ChatMessage, ChatSummary, MessageId, UserId};

use crate::error::{Result, StoreError};
use crate::models::{Chat, ChatSnapshot};
use crate::sessions::SessionRegistry;

#[derive(Debug)]
pub struct ChatStore {
    chats: HashMap<ChatId, Chat>,
    messages: HashMap<ChatId, Vec<ChatMessage>>,
    id_digits: u32,
    history_limit: usize,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_CHAT_ID_DIGITS, DEFAULT_HISTORY_LIMIT)
    }

    /// Store with `id_digits`-wide numeric codes (clamped to 1..=9) and a
    /// default history window of `history_limit` messages.
    pub fn with_settings(id_digits: u32, history_limit: usize) -> Self {
        Self {
            chats: HashMap::new(),
            messages: HashMap::new(),
            id_digits: id_digits.clamp(1, MAX_CHAT_ID_DIGITS),
            history_limit: history_limit.max(1),
        }
    }

    /// New chat whose only participant is `user_id`.
    pub fn create_solo(&mut self, user_id: &UserId) -> Result<ChatId> {
        let id = self.next_numeric_id()?;
        Ok(self.insert_chat(id, vec![user_id.clone()]))
    }

    /// New chat between `user_id` and the AI sentinel.
    pub fn create_with_ai(&mut self, user_id: &UserId) -> Result<ChatId> {
        let id = self.next_numeric_id()?;
        Ok(self.insert_chat(id, vec![user_id.clone(), UserId::ai()]))
    }

    /// Chat whose participant set equals `participants`, created if missing.
    ///
    /// Comparison ignores order and duplicates. When several chats match,
    /// the oldest wins.
    pub fn find_or_create_by_participants(&mut self, participants: &[UserId]) -> Result<ChatId> {
        let wanted: BTreeSet<&UserId> = participants.iter().collect();
        if wanted.is_empty() {
            return Err(StoreError::NoParticipants);
        }

        let existing = self
            .chats
            .values()
            .filter(|chat| chat.participant_set() == wanted)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .map(|chat| chat.id.clone());
        if let Some(id) = existing {
            return Ok(id);
        }

        let sorted: Vec<UserId> = wanted.into_iter().cloned().collect();
        let id = self.derived_id(&sorted);
        Ok(self.insert_chat(id, sorted))
    }

    /// Add `user_id` to a chat. Joining twice has no further effect.
    ///
    /// Returns `false` if the chat does not exist.
    pub fn join(&mut self, chat_id: &ChatId, user_id: &UserId) -> bool {
        let Some(chat) = self.chats.get_mut(chat_id) else {
            return false;
        };
        if !chat.has_participant(user_id) {
            chat.participants.push(user_id.clone());
            debug!(chat = %chat_id, user = %user_id, "Participant joined chat");
        }
        true
    }

    /// Append a message to a chat's log, creating the log if needed.
    ///
    /// Membership of `from` is checked by the caller.
    pub fn append_message(&mut self, chat_id: &ChatId, from: &UserId, text: &str) -> ChatMessage {
        let message = ChatMessage {
            id: MessageId::new(),
            chat_id: chat_id.clone(),
            from: from.clone(),
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        self.messages
            .entry(chat_id.clone())
            .or_default()
            .push(message.clone());
        message
    }

    /// The last `limit` messages in insertion order.
    ///
    /// `None` or `Some(0)` uses the store's default window. Unknown chats
    /// have an empty history.
    pub fn history(&self, chat_id: &ChatId, limit: Option<usize>) -> Vec<ChatMessage> {
        let limit = match limit {
            None | Some(0) => self.history_limit,
            Some(n) => n,
        };
        let log = self.log(chat_id);
        log[log.len().saturating_sub(limit)..].to_vec()
    }

    /// Every message of a chat in insertion order.
    pub fn full_history(&self, chat_id: &ChatId) -> Vec<ChatMessage> {
        self.log(chat_id).to_vec()
    }

    pub fn message_count(&self, chat_id: &ChatId) -> usize {
        self.log(chat_id).len()
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<&Chat> {
        self.chats.get(chat_id)
    }

    /// Whether `user_id` already has a chat with the AI sentinel.
    pub fn has_ai_chat(&self, user_id: &UserId) -> bool {
        self.chats
            .values()
            .any(|chat| chat.has_ai() && chat.has_participant(user_id))
    }

    /// Summaries of every chat `user_id` participates in, oldest first.
    pub fn threads_for(&self, user_id: &UserId, sessions: &SessionRegistry) -> Vec<ChatSummary> {
        let mut chats: Vec<&Chat> = self
            .chats
            .values()
            .filter(|chat| chat.has_participant(user_id))
            .collect();
        chats.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        chats
            .into_iter()
            .map(|chat| {
                let log = self.log(&chat.id);
                ChatSummary {
                    chat_id: chat.id.clone(),
                    participants: chat
                        .participants
                        .iter()
                        .map(|id| sessions.resolve(id))
                        .collect(),
                    created_at: chat.created_at,
                    message_count: log.len(),
                    last_message: log.last().cloned(),
                }
            })
            .collect()
    }

    /// Every chat and message log, for debug listings.
    pub fn snapshot(&self) -> ChatSnapshot {
        let mut chats: Vec<Chat> = self.chats.values().cloned().collect();
        chats.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let messages: BTreeMap<ChatId, Vec<ChatMessage>> = self
            .messages
            .iter()
            .map(|(id, log)| (id.clone(), log.clone()))
            .collect();

        ChatSnapshot { chats, messages }
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    fn log(&self, chat_id: &ChatId) -> &[ChatMessage] {
        self.messages.get(chat_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn insert_chat(&mut self, id: ChatId, participants: Vec<UserId>) -> ChatId {
        debug!(chat = %id, participants = participants.len(), "Created chat");
        self.chats.insert(
            id.clone(),
            Chat {
                id: id.clone(),
                participants,
                created_at: Utc::now(),
            },
        );
        self.messages.insert(id.clone(), Vec::new());
        id
    }

    /// Random unused code in `[10^(d-1), 10^d)`, redrawn on collision.
    fn next_numeric_id(&self) -> Result<ChatId> {
        let low = 10u64.pow(self.id_digits - 1);
        let high = 10u64.pow(self.id_digits);

        let taken = self
            .chats
            .keys()
            .filter(|id| id.is_numeric() && id.as_str().len() == self.id_digits as usize)
            .count() as u64;
        if taken >= high - low {
            return Err(StoreError::ChatIdSpaceExhausted {
                digits: self.id_digits,
            });
        }

        let mut rng = rand::thread_rng();
        loop {
            let id = ChatId(rng.gen_range(low..high).to_string());
            if !self.chats.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Token derived from a sorted participant list, salted on collision.
    fn derived_id(&self, sorted: &[UserId]) -> ChatId {
        let mut salt: u32 = 0;
        loop {
            let mut hasher = blake3::Hasher::new();
            for id in sorted {
                hasher.update(id.as_str().as_bytes());
                hasher.update(b"\n");
            }
            if salt > 0 {
                hasher.update(&salt.to_le_bytes());
            }
            let hex = hasher.finalize().to_hex();
            let id = ChatId(hex.as_str()[..DERIVED_CHAT_ID_LEN].to_string());
            if !self.chats.contains_key(&id) {
                return id;
            }
            salt += 1;
        }
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}
