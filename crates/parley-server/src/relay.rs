//! Relay protocol handler.
//!
//! One [`Connection`] per client socket. A connection starts unbound; the
//! first JSON object it sends binds it to an identity, either the one named
//! by a `reconnect` event or the one registered for its network address.
//! Every later event is validated against the session registry and the chat
//! store, applied, and fanned out to the live transports it concerns.
//!
//! Both stores sit behind one async mutex. An event's validation, mutation
//! and fan-out happen under a single lock acquisition, so events from
//! different connections never interleave mid-update. Reply generation for
//! AI chats runs in a spawned task outside the lock and takes it again only
//! to append and deliver the reply, which therefore always reaches each
//! participant after the message that triggered it.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use parley_shared::constants::BANNED_REASON;
use parley_shared::{
    ChatId, ChatMessage, ClientEvent, Inbound, SendError, ServerEvent, Transport, UserId,
};
use parley_store::{BannedAddress, Chat, ChatSnapshot, ChatStore, IdentityInfo, SessionRegistry};

use crate::reply::ReplyGenerator;

const CHAT_NOT_FOUND: &str = "Chat does not exist.";
const NOT_A_PARTICIPANT: &str = "You are not a participant of this chat.";
const JOIN_CODE_NOT_FOUND: &str = "No chat exists with this id.";
const UNKNOWN_USER: &str = "Unknown user id.";

struct RelayState {
    sessions: SessionRegistry,
    chats: ChatStore,
}

#[derive(Clone)]
pub struct Relay {
    state: Arc<Mutex<RelayState>>,
    replies: Arc<dyn ReplyGenerator>,
}

/// Per-connection context: the transport, the observed network address and
/// the identity bound to it, if any.
#[derive(Debug)]
pub struct Connection {
    transport: Transport,
    address: String,
    user: Option<UserId>,
}

impl Connection {
    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Relay {
    pub fn new(
        sessions: SessionRegistry,
        chats: ChatStore,
        replies: Arc<dyn ReplyGenerator>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState { sessions, chats })),
            replies,
        }
    }

    /// Accept a new connection from `address`.
    ///
    /// A banned address gets a `banned` notice and its transport closed;
    /// no identity is created or touched.
    pub async fn open(&self, transport: Transport, address: impl Into<String>) -> Option<Connection> {
        let address = address.into();
        let banned = self.state.lock().await.sessions.is_banned(&address);
        if banned {
            info!(address = %address, "Rejected connection from banned address");
            reject(&transport);
            return None;
        }

        debug!(address = %address, connection = %transport.id(), "Connection opened");
        Some(Connection {
            transport,
            address,
            user: None,
        })
    }

    /// Handle one text frame. Malformed frames are logged and dropped.
    pub async fn handle_frame(&self, conn: &mut Connection, raw: &str) {
        if !conn.transport.is_open() {
            debug!(address = %conn.address, user = ?conn.user, "Dropping frame on closed connection");
            return;
        }

        let parsed = Inbound::parse(raw);

        let Some(user_id) = conn.user.clone() else {
            match parsed {
                Ok(inbound) => self.establish(conn, Some(inbound)).await,
                Err(e) if e.is_object() => {
                    warn!(address = %conn.address, error = %e, "Malformed first frame");
                    self.establish(conn, None).await;
                }
                Err(e) => warn!(address = %conn.address, error = %e, "Ignoring malformed frame"),
            }
            return;
        };

        match parsed {
            Ok(Inbound::Event(event)) => self.dispatch(conn, &user_id, event).await,
            Ok(Inbound::Untyped) => debug!(user = %user_id, "Ignoring untyped frame"),
            Err(e) => warn!(user = %user_id, error = %e, "Ignoring malformed frame"),
        }
    }

    /// Detach a closed connection from its identity. The identity is kept.
    pub async fn close(&self, conn: Connection) {
        if let Some(user_id) = &conn.user {
            self.state
                .lock()
                .await
                .sessions
                .detach(user_id, conn.transport.id());
        }
        conn.transport.close();
        debug!(address = %conn.address, user = ?conn.user, "Connection closed");
    }

    // -- Admin surface --

    pub async fn list_identities(&self) -> Vec<IdentityInfo> {
        self.state.lock().await.sessions.all()
    }

    pub async fn list_banned_addresses_with_owners(&self) -> Vec<BannedAddress> {
        self.state.lock().await.sessions.banned_with_owners()
    }

    /// Ban an address; returns how many live connections were closed.
    pub async fn ban(&self, address: &str) -> usize {
        self.state.lock().await.sessions.ban(address)
    }

    pub async fn unban(&self, address: &str) -> bool {
        self.state.lock().await.sessions.unban(address)
    }

    /// Ban one identity regardless of where it connects from.
    pub async fn ban_user(&self, user_id: &UserId) -> bool {
        self.state.lock().await.sessions.ban_user(user_id)
    }

    pub async fn unban_user(&self, user_id: &UserId) -> bool {
        self.state.lock().await.sessions.unban_user(user_id)
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        self.state.lock().await.chats.snapshot()
    }

    // -- Identity establishment --

    async fn establish(&self, conn: &mut Connection, inbound: Option<Inbound>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.sessions.is_banned(&conn.address) {
            reject(&conn.transport);
            return;
        }

        let requested = match inbound {
            Some(Inbound::Event(ClientEvent::Reconnect { user_id })) => Some(user_id),
            _ => None,
        };

        let rebound = match requested {
            Some(id) if state.sessions.is_user_banned(&id) => {
                info!(user = %id, "Rejected reconnect of banned identity");
                reject(&conn.transport);
                return;
            }
            Some(id) => match state.sessions.rebind_by_token(
                &id,
                conn.transport.clone(),
                &conn.address,
            ) {
                Ok(name) => Some((id, name)),
                Err(e) => {
                    debug!(error = %e, "Reconnect with unknown id, registering by address");
                    None
                }
            },
            None => None,
        };

        let (user_id, name) = match rebound {
            Some(pair) => pair,
            None => {
                let registration = state.sessions.register(conn.transport.clone(), &conn.address);
                if state.sessions.is_user_banned(&registration.user_id) {
                    reject(&conn.transport);
                    return;
                }
                (registration.user_id, registration.name)
            }
        };

        conn.user = Some(user_id.clone());
        deliver(
            &conn.transport,
            ServerEvent::Welcome {
                user_id: user_id.clone(),
                name,
            },
        );

        if !state.chats.has_ai_chat(&user_id) {
            match state.chats.create_with_ai(&user_id) {
                Ok(chat_id) => deliver(
                    &conn.transport,
                    ServerEvent::AiChatCreated {
                        chat_id,
                        participants: vec![user_id.clone(), UserId::ai()],
                    },
                ),
                Err(e) => warn!(user = %user_id, error = %e, "Could not create AI chat"),
            }
        }

        info!(user = %user_id, address = %conn.address, "Connection bound");
    }

    // -- Bound events --

    async fn dispatch(&self, conn: &mut Connection, user_id: &UserId, event: ClientEvent) {
        match event {
            ClientEvent::Reconnect { user_id: target } => {
                self.rebind(conn, user_id, target).await;
            }
            ClientEvent::SetName { name } => {
                self.state.lock().await.sessions.rename(user_id, &name);
            }
            ClientEvent::MessageTo { chat_id, text } => {
                self.send_message(conn, user_id, chat_id, text).await;
            }
            ClientEvent::GetChat { chat_id, limit } => {
                self.get_chat(conn, user_id, &chat_id, limit).await;
            }
            ClientEvent::GetChatByNames { names } => {
                self.get_chat_by_names(conn, user_id, &names).await;
            }
            ClientEvent::GetUserChats => {
                let state = self.state.lock().await;
                let chats = state.chats.threads_for(user_id, &state.sessions);
                deliver(&conn.transport, ServerEvent::UserChats { chats });
            }
            ClientEvent::CreateEmptyChat => {
                let created = self.state.lock().await.chats.create_solo(user_id);
                match created {
                    Ok(chat_id) => deliver(
                        &conn.transport,
                        ServerEvent::EmptyChatCreated {
                            chat_id,
                            participants: vec![user_id.clone()],
                        },
                    ),
                    Err(e) => {
                        warn!(user = %user_id, error = %e, "Could not create chat");
                        deliver(&conn.transport, ServerEvent::error(e.to_string()));
                    }
                }
            }
            ClientEvent::JoinChatById { chat_id } => {
                self.join_chat(conn, user_id, chat_id).await;
            }
            ClientEvent::Unknown => {
                debug!(user = %user_id, "Ignoring unknown event type");
            }
        }
    }

    async fn rebind(&self, conn: &mut Connection, current: &UserId, target: UserId) {
        let mut state = self.state.lock().await;

        if state.sessions.is_user_banned(&target) {
            reject(&conn.transport);
            return;
        }

        match state
            .sessions
            .rebind_by_token(&target, conn.transport.clone(), &conn.address)
        {
            Ok(name) => {
                if &target != current {
                    state.sessions.detach(current, conn.transport.id());
                    info!(from = %current, to = %target, "Connection rebound to another identity");
                }
                conn.user = Some(target.clone());
                deliver(
                    &conn.transport,
                    ServerEvent::Welcome {
                        user_id: target,
                        name,
                    },
                );
            }
            Err(e) => {
                debug!(user = %current, error = %e, "Rejected reconnect");
                deliver(&conn.transport, ServerEvent::error(UNKNOWN_USER));
            }
        }
    }

    async fn send_message(&self, conn: &Connection, user_id: &UserId, chat_id: ChatId, text: String) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(chat) = state.chats.get(&chat_id) else {
            deliver(&conn.transport, ServerEvent::error(CHAT_NOT_FOUND));
            return;
        };
        if !chat.has_participant(user_id) {
            deliver(&conn.transport, ServerEvent::error(NOT_A_PARTICIPANT));
            return;
        }
        let participants = chat.participants.clone();
        let wants_reply = chat.has_ai();

        let message = state.chats.append_message(&chat_id, user_id, &text);
        fan_out(&state.sessions, &participants, &ServerEvent::from(&message), None);
        debug!(chat = %chat_id, from = %user_id, "Message delivered");

        drop(guard);

        if wants_reply {
            self.spawn_reply(chat_id, text);
        }
    }

    /// Generate the AI reply off the lock, then append and fan it out.
    fn spawn_reply(&self, chat_id: ChatId, text: String) {
        let state = self.state.clone();
        let pending = self.replies.generate(text);

        tokio::spawn(async move {
            let reply = pending.await;

            let mut guard = state.lock().await;
            let state = &mut *guard;
            let message = state.chats.append_message(&chat_id, &UserId::ai(), &reply);
            let participants = state
                .chats
                .get(&chat_id)
                .map(|chat| chat.participants.clone())
                .unwrap_or_default();
            fan_out(&state.sessions, &participants, &ServerEvent::from(&message), None);
            debug!(chat = %chat_id, "AI reply delivered");
        });
    }

    async fn get_chat(&self, conn: &Connection, user_id: &UserId, chat_id: &ChatId, limit: Option<usize>) {
        let state = self.state.lock().await;

        let Some(chat) = state.chats.get(chat_id) else {
            deliver(&conn.transport, ServerEvent::error(CHAT_NOT_FOUND));
            return;
        };
        if !chat.has_participant(user_id) {
            deliver(&conn.transport, ServerEvent::error(NOT_A_PARTICIPANT));
            return;
        }

        let messages = match limit {
            Some(_) => state.chats.history(chat_id, limit),
            None => state.chats.full_history(chat_id),
        };
        deliver(&conn.transport, chat_event(&state.sessions, chat, messages));
    }

    async fn get_chat_by_names(&self, conn: &Connection, user_id: &UserId, names: &[String]) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut participants = Vec::with_capacity(names.len() + 1);
        for name in names {
            match state.sessions.find_by_name(name) {
                Some(id) => participants.push(id),
                None => {
                    deliver(
                        &conn.transport,
                        ServerEvent::error(format!("User \"{name}\" not found.")),
                    );
                    return;
                }
            }
        }
        if !participants.contains(user_id) {
            participants.push(user_id.clone());
        }

        let chat_id = match state.chats.find_or_create_by_participants(&participants) {
            Ok(chat_id) => chat_id,
            Err(e) => {
                deliver(&conn.transport, ServerEvent::error(e.to_string()));
                return;
            }
        };

        if let Some(chat) = state.chats.get(&chat_id) {
            let messages = state.chats.history(&chat_id, None);
            deliver(&conn.transport, chat_event(&state.sessions, chat, messages));
        }
    }

    async fn join_chat(&self, conn: &Connection, user_id: &UserId, chat_id: ChatId) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let already_member = state
            .chats
            .get(&chat_id)
            .is_some_and(|chat| chat.has_participant(user_id));

        if !state.chats.join(&chat_id, user_id) {
            deliver(&conn.transport, ServerEvent::error(JOIN_CODE_NOT_FOUND));
            return;
        }
        let Some(chat) = state.chats.get(&chat_id) else {
            return;
        };

        deliver(
            &conn.transport,
            ServerEvent::JoinedChat {
                chat_id: chat_id.clone(),
                participants: chat.participants.clone(),
                created_at: chat.created_at,
            },
        );

        if already_member {
            return;
        }

        let name = state.sessions.lookup(user_id).map(|identity| identity.name.clone());
        let notice = ServerEvent::ParticipantJoined {
            chat_id: chat_id.clone(),
            user_id: user_id.clone(),
            name,
        };
        fan_out(&state.sessions, &chat.participants, &notice, Some(user_id));
        info!(chat = %chat_id, user = %user_id, "Joined chat");
    }
}

fn chat_event(sessions: &SessionRegistry, chat: &Chat, messages: Vec<ChatMessage>) -> ServerEvent {
    ServerEvent::Chat {
        chat_id: chat.id.clone(),
        participants: chat.participants.iter().map(|id| sessions.resolve(id)).collect(),
        messages,
        created_at: chat.created_at,
    }
}

/// Queue `event` on `transport`, logging instead of failing.
fn deliver(transport: &Transport, event: ServerEvent) {
    let kind = event.kind();
    match transport.send(event) {
        Ok(()) => {}
        Err(SendError::Full) => {
            warn!(connection = %transport.id(), kind, "Send queue full, dropping event");
        }
        Err(SendError::Closed) => {
            debug!(connection = %transport.id(), kind, "Skipping closed transport");
        }
    }
}

/// Deliver `event` to every participant with a live transport.
fn fan_out(sessions: &SessionRegistry, participants: &[UserId], event: &ServerEvent, skip: Option<&UserId>) {
    for participant in participants {
        if Some(participant) == skip {
            continue;
        }
        if let Some(transport) = sessions.live_transport(participant) {
            deliver(transport, event.clone());
        }
    }
}

fn reject(transport: &Transport) {
    deliver(
        transport,
        ServerEvent::Banned {
            reason: BANNED_REASON.to_string(),
        },
    );
    transport.close();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use tokio::sync::Notify;

    use parley_shared::constants::AI_APOLOGY;
    use parley_shared::TransportReceiver;

    use super::*;
    use crate::reply::FallbackReplyGenerator;

    /// Replies `re: <text>` once the gate is opened.
    struct GatedReplies {
        gate: Arc<Notify>,
    }

    impl ReplyGenerator for GatedReplies {
        fn generate(&self, text: String) -> BoxFuture<'static, String> {
            let gate = self.gate.clone();
            Box::pin(async move {
                gate.notified().await;
                format!("re: {text}")
            })
        }
    }

    struct EchoReplies;

    impl ReplyGenerator for EchoReplies {
        fn generate(&self, text: String) -> BoxFuture<'static, String> {
            Box::pin(async move { format!("re: {text}") })
        }
    }

    fn relay_with(replies: Arc<dyn ReplyGenerator>) -> Relay {
        Relay::new(SessionRegistry::new(), ChatStore::new(), replies)
    }

    fn relay() -> Relay {
        relay_with(Arc::new(EchoReplies))
    }

    async fn next(rx: &mut TransportReceiver) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("transport closed")
    }

    async fn open(relay: &Relay, address: &str) -> (Connection, TransportReceiver) {
        let (transport, rx) = Transport::channel(64);
        let conn = relay.open(transport, address).await.expect("not banned");
        (conn, rx)
    }

    struct Client {
        conn: Connection,
        rx: TransportReceiver,
        id: UserId,
        ai_chat: Option<ChatId>,
    }

    /// Open and bind a connection, consuming `welcome` and `aiChatCreated`.
    async fn join(relay: &Relay, address: &str) -> Client {
        let (mut conn, mut rx) = open(relay, address).await;
        relay.handle_frame(&mut conn, "{}").await;

        let ServerEvent::Welcome { user_id, .. } = next(&mut rx).await else {
            panic!("expected welcome");
        };
        let ai_chat = match rx.try_recv() {
            Some(ServerEvent::AiChatCreated { chat_id, .. }) => Some(chat_id),
            None => None,
            Some(other) => panic!("unexpected {other:?}"),
        };
        Client {
            conn,
            rx,
            id: user_id,
            ai_chat,
        }
    }

    impl Client {
        async fn send(&mut self, relay: &Relay, frame: serde_json::Value) {
            relay.handle_frame(&mut self.conn, &frame.to_string()).await;
        }
    }

    async fn create_chat(relay: &Relay, client: &mut Client) -> ChatId {
        client
            .send(relay, serde_json::json!({ "type": "createEmptyChat" }))
            .await;
        match next(&mut client.rx).await {
            ServerEvent::EmptyChatCreated { chat_id, participants } => {
                assert_eq!(participants, vec![client.id.clone()]);
                chat_id
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_frame_yields_single_welcome() {
        let relay = relay();
        let (mut conn, mut rx) = open(&relay, "10.0.0.1").await;
        assert!(conn.user().is_none());

        relay.handle_frame(&mut conn, "{}").await;

        let ServerEvent::Welcome { user_id, name } = next(&mut rx).await else {
            panic!("expected welcome");
        };
        assert!(name.starts_with("Guest_"));
        assert_eq!(conn.user(), Some(&user_id));
        match next(&mut rx).await {
            ServerEvent::AiChatCreated { participants, .. } => {
                assert_eq!(participants, vec![user_id.clone(), UserId::ai()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_none());

        // A second connection from elsewhere gets a fresh id.
        let other = join(&relay, "10.0.0.2").await;
        assert_ne!(other.id, user_id);
    }

    #[tokio::test]
    async fn test_any_typed_first_frame_establishes_identity() {
        let relay = relay();
        let (mut conn, mut rx) = open(&relay, "10.0.0.1").await;

        relay
            .handle_frame(&mut conn, r#"{"type":"messageTo","chatId":"1"}"#)
            .await;

        assert!(matches!(next(&mut rx).await, ServerEvent::Welcome { .. }));
        assert!(matches!(next(&mut rx).await, ServerEvent::AiChatCreated { .. }));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_tolerated() {
        let relay = relay();
        let (mut conn, mut rx) = open(&relay, "10.0.0.1").await;

        // Only a JSON object can bind a connection.
        for frame in ["not json", "[1, 2, 3]", "42", r#""x""#, "null", "true"] {
            relay.handle_frame(&mut conn, frame).await;
        }
        assert!(rx.try_recv().is_none());
        assert!(conn.user().is_none());
        assert!(relay.list_identities().await.is_empty());

        relay.handle_frame(&mut conn, "{}").await;
        assert!(matches!(next(&mut rx).await, ServerEvent::Welcome { .. }));
        let _ai = next(&mut rx).await;

        relay.handle_frame(&mut conn, "}{").await;
        relay.handle_frame(&mut conn, r#"{"type":"joinChatById"}"#).await;
        relay.handle_frame(&mut conn, r#"{"type":"somethingElse"}"#).await;
        relay.handle_frame(&mut conn, r#"{"no":"type"}"#).await;
        assert!(rx.try_recv().is_none());
        assert!(conn.user().is_some());
    }

    #[tokio::test]
    async fn test_ban_follows_token_reconnect_to_new_address() {
        let relay = relay();
        let x = join(&relay, "10.0.0.1").await;
        let id = x.id.clone();
        relay.close(x.conn).await;

        let (mut conn, mut rx) = open(&relay, "10.0.0.99").await;
        relay
            .handle_frame(
                &mut conn,
                &serde_json::json!({ "type": "reconnect", "userId": id }).to_string(),
            )
            .await;
        assert!(matches!(next(&mut rx).await, ServerEvent::Welcome { .. }));

        assert_eq!(relay.ban("10.0.0.99").await, 1);
        assert_eq!(rx.recv().await, None);

        let banned = relay.list_banned_addresses_with_owners().await;
        assert_eq!(banned[0].owners.len(), 1);
        assert_eq!(banned[0].owners[0].id, id);

        // The address it left is free again.
        let other = join(&relay, "10.0.0.1").await;
        assert_ne!(other.id, id);
    }

    #[tokio::test]
    async fn test_frames_after_ban_are_dropped() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let mut y = join(&relay, "10.0.0.2").await;
        let chat_id = create_chat(&relay, &mut x).await;

        y.send(&relay, serde_json::json!({ "type": "joinChatById", "chatId": chat_id }))
            .await;
        let _joined = next(&mut y.rx).await;
        let _notice = next(&mut x.rx).await;

        assert_eq!(relay.ban("10.0.0.1").await, 1);

        x.send(
            &relay,
            serde_json::json!({ "type": "messageTo", "chatId": chat_id, "text": "still here" }),
        )
        .await;
        x.send(&relay, serde_json::json!({ "type": "createEmptyChat" })).await;

        assert!(y.rx.try_recv().is_none());
        let snapshot = relay.snapshot().await;
        assert!(snapshot.messages[&chat_id].is_empty());
        assert_eq!(snapshot.chats.len(), 3);
    }

    #[tokio::test]
    async fn test_banned_address_is_rejected_at_open() {
        let relay = relay();
        relay.ban("10.6.6.6").await;

        let (transport, mut rx) = Transport::channel(8);
        assert!(relay.open(transport.clone(), "10.6.6.6").await.is_none());

        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::Banned {
                reason: BANNED_REASON.to_string()
            })
        );
        assert_eq!(rx.recv().await, None);
        assert!(!transport.is_open());
        assert!(relay.list_identities().await.is_empty());
    }

    #[tokio::test]
    async fn test_solo_chat_join_and_message_scenario() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let mut y = join(&relay, "10.0.0.2").await;

        let chat_id = create_chat(&relay, &mut x).await;

        y.send(&relay, serde_json::json!({ "type": "joinChatById", "chatId": chat_id }))
            .await;
        match next(&mut y.rx).await {
            ServerEvent::JoinedChat { chat_id: joined, participants, .. } => {
                assert_eq!(joined, chat_id);
                assert_eq!(participants, vec![x.id.clone(), y.id.clone()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut x.rx).await {
            ServerEvent::ParticipantJoined { chat_id: joined, user_id, .. } => {
                assert_eq!(joined, chat_id);
                assert_eq!(user_id, y.id);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(y.rx.try_recv().is_none(), "joiner is not notified of itself");

        x.send(
            &relay,
            serde_json::json!({ "type": "messageTo", "chatId": chat_id, "text": "hi" }),
        )
        .await;
        for rx in [&mut x.rx, &mut y.rx] {
            match next(rx).await {
                ServerEvent::Message { chat_id: got, from, text, .. } => {
                    assert_eq!(got, chat_id);
                    assert_eq!(from, x.id);
                    assert_eq!(text, "hi");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_join_twice_notifies_once() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let mut y = join(&relay, "10.0.0.2").await;
        let chat_id = create_chat(&relay, &mut x).await;

        for _ in 0..2 {
            y.send(&relay, serde_json::json!({ "type": "joinChatById", "chatId": chat_id }))
                .await;
            assert!(matches!(next(&mut y.rx).await, ServerEvent::JoinedChat { .. }));
        }
        assert!(matches!(next(&mut x.rx).await, ServerEvent::ParticipantJoined { .. }));
        assert!(x.rx.try_recv().is_none());

        let snapshot = relay.snapshot().await;
        let chat = snapshot.chats.iter().find(|c| c.id == chat_id).unwrap();
        assert_eq!(chat.participants.len(), 2);
    }

    #[tokio::test]
    async fn test_join_unknown_chat() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        x.send(&relay, serde_json::json!({ "type": "joinChatById", "chatId": "00000" }))
            .await;
        assert_eq!(next(&mut x.rx).await, ServerEvent::error(JOIN_CODE_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_message_to_unknown_chat_is_an_error_without_mutation() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let before = relay.snapshot().await;

        x.send(
            &relay,
            serde_json::json!({ "type": "messageTo", "chatId": "nope", "text": "hi" }),
        )
        .await;

        assert_eq!(next(&mut x.rx).await, ServerEvent::error(CHAT_NOT_FOUND));
        assert!(x.rx.try_recv().is_none());

        let after = relay.snapshot().await;
        assert_eq!(after.chats, before.chats);
        assert_eq!(after.messages, before.messages);
    }

    #[tokio::test]
    async fn test_non_participant_cannot_post_or_read() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let mut y = join(&relay, "10.0.0.2").await;
        let chat_id = create_chat(&relay, &mut x).await;

        y.send(
            &relay,
            serde_json::json!({ "type": "messageTo", "chatId": chat_id, "text": "hi" }),
        )
        .await;
        assert_eq!(next(&mut y.rx).await, ServerEvent::error(NOT_A_PARTICIPANT));

        y.send(&relay, serde_json::json!({ "type": "getChat", "chatId": chat_id }))
            .await;
        assert_eq!(next(&mut y.rx).await, ServerEvent::error(NOT_A_PARTICIPANT));

        assert!(x.rx.try_recv().is_none(), "errors are never broadcast");
    }

    #[tokio::test]
    async fn test_ai_chat_delivers_human_then_ai() {
        let gate = Arc::new(Notify::new());
        let relay = relay_with(Arc::new(GatedReplies { gate: gate.clone() }));
        let mut x = join(&relay, "10.0.0.1").await;
        let ai_chat = x.ai_chat.clone().unwrap();

        x.send(
            &relay,
            serde_json::json!({ "type": "messageTo", "chatId": ai_chat, "text": "hello" }),
        )
        .await;

        // The human message is delivered while the reply is still pending.
        match next(&mut x.rx).await {
            ServerEvent::Message { from, text, .. } => {
                assert_eq!(from, x.id);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(x.rx.try_recv().is_none());

        gate.notify_one();
        match next(&mut x.rx).await {
            ServerEvent::Message { from, text, chat_id, .. } => {
                assert!(from.is_ai());
                assert_eq!(text, "re: hello");
                assert_eq!(chat_id, ai_chat);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(x.rx.try_recv().is_none());

        let snapshot = relay.snapshot().await;
        let log = &snapshot.messages[&ai_chat];
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].from, x.id);
        assert!(log[1].from.is_ai());
    }

    #[tokio::test]
    async fn test_ai_reply_reaches_every_live_participant() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let mut y = join(&relay, "10.0.0.2").await;
        let ai_chat = x.ai_chat.clone().unwrap();

        y.send(&relay, serde_json::json!({ "type": "joinChatById", "chatId": ai_chat }))
            .await;
        let _joined = next(&mut y.rx).await;
        let _notice = next(&mut x.rx).await;

        y.send(
            &relay,
            serde_json::json!({ "type": "messageTo", "chatId": ai_chat, "text": "yo" }),
        )
        .await;

        for rx in [&mut x.rx, &mut y.rx] {
            let texts: Vec<String> = [next(rx).await, next(rx).await]
                .into_iter()
                .map(|event| match event {
                    ServerEvent::Message { text, .. } => text,
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            assert_eq!(texts, vec!["yo".to_string(), "re: yo".to_string()]);
            assert!(rx.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn test_ai_failure_becomes_apology_message() {
        let relay = relay_with(Arc::new(FallbackReplyGenerator));
        let mut x = join(&relay, "10.0.0.1").await;
        let ai_chat = x.ai_chat.clone().unwrap();

        x.send(
            &relay,
            serde_json::json!({ "type": "messageTo", "chatId": ai_chat, "text": "hello" }),
        )
        .await;
        let _human = next(&mut x.rx).await;
        match next(&mut x.rx).await {
            ServerEvent::Message { from, text, .. } => {
                assert!(from.is_ai());
                assert_eq!(text, AI_APOLOGY);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ai_reply_after_disconnect_is_still_recorded() {
        let gate = Arc::new(Notify::new());
        let relay = relay_with(Arc::new(GatedReplies { gate: gate.clone() }));
        let mut x = join(&relay, "10.0.0.1").await;
        let ai_chat = x.ai_chat.clone().unwrap();

        x.send(
            &relay,
            serde_json::json!({ "type": "messageTo", "chatId": ai_chat, "text": "bye" }),
        )
        .await;
        let _human = next(&mut x.rx).await;

        let Client { conn, mut rx, .. } = x;
        relay.close(conn).await;
        gate.notify_one();

        assert_eq!(rx.recv().await, None);
        for _ in 0..50 {
            if relay.snapshot().await.messages[&ai_chat].len() == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("AI reply was not appended");
    }

    #[tokio::test]
    async fn test_ban_closes_live_connections_idempotently() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let mut y = join(&relay, "10.0.0.2").await;

        assert_eq!(relay.ban("10.0.0.1").await, 1);
        assert_eq!(x.rx.recv().await, None);
        assert_eq!(relay.ban("10.0.0.1").await, 0);

        // Identity survives the ban.
        let identities = relay.list_identities().await;
        assert!(identities.iter().any(|i| i.id == x.id && !i.connected));

        let banned = relay.list_banned_addresses_with_owners().await;
        assert_eq!(banned.len(), 1);
        assert_eq!(banned[0].owners[0].id, x.id);

        // Unbanning does not reconnect anyone.
        assert!(relay.unban("10.0.0.1").await);
        assert!(x.rx.try_recv().is_none());

        y.send(&relay, serde_json::json!({ "type": "getUserChats" })).await;
        assert!(matches!(next(&mut y.rx).await, ServerEvent::UserChats { .. }));
    }

    #[tokio::test]
    async fn test_banned_identity_cannot_reconnect() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let id = x.id.clone();

        assert!(relay.ban_user(&id).await);
        assert!(!relay.ban_user(&id).await);
        assert_eq!(x.rx.recv().await, None);

        let (mut conn, mut rx) = open(&relay, "10.0.0.50").await;
        relay
            .handle_frame(
                &mut conn,
                &serde_json::json!({ "type": "reconnect", "userId": id }).to_string(),
            )
            .await;
        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::Banned {
                reason: BANNED_REASON.to_string()
            })
        );
        assert_eq!(rx.recv().await, None);
        assert!(conn.user().is_none());

        // Same address without a token also resolves to the banned identity.
        let (mut conn, mut rx) = open(&relay, "10.0.0.1").await;
        relay.handle_frame(&mut conn, "{}").await;
        assert!(matches!(rx.recv().await, Some(ServerEvent::Banned { .. })));

        assert!(relay.unban_user(&id).await);
        let again = join(&relay, "10.0.0.1").await;
        assert_eq!(again.id, id);
    }

    #[tokio::test]
    async fn test_reconnect_by_address_keeps_identity() {
        let relay = relay();
        let x = join(&relay, "10.0.0.1").await;
        let id = x.id.clone();
        relay.close(x.conn).await;

        let again = join(&relay, "10.0.0.1").await;
        assert_eq!(again.id, id);
        assert!(again.ai_chat.is_none(), "AI chat already exists");
    }

    #[tokio::test]
    async fn test_reconnect_by_token() {
        let relay = relay();
        let x = join(&relay, "10.0.0.1").await;
        let id = x.id.clone();
        relay.close(x.conn).await;

        let (mut conn, mut rx) = open(&relay, "10.0.0.99").await;
        relay
            .handle_frame(
                &mut conn,
                &serde_json::json!({ "type": "reconnect", "userId": id }).to_string(),
            )
            .await;

        match next(&mut rx).await {
            ServerEvent::Welcome { user_id, .. } => assert_eq!(user_id, id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_none());
        assert_eq!(conn.user(), Some(&id));
    }

    #[tokio::test]
    async fn test_reconnect_with_unknown_token_registers() {
        let relay = relay();
        let (mut conn, mut rx) = open(&relay, "10.0.0.1").await;
        relay
            .handle_frame(&mut conn, r#"{"type":"reconnect","userId":"stale"}"#)
            .await;

        match next(&mut rx).await {
            ServerEvent::Welcome { user_id, .. } => assert_ne!(user_id.as_str(), "stale"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_while_bound() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let y = join(&relay, "10.0.0.2").await;
        let y_id = y.id.clone();
        relay.close(y.conn).await;

        x.send(&relay, serde_json::json!({ "type": "reconnect", "userId": "ghost" }))
            .await;
        assert_eq!(next(&mut x.rx).await, ServerEvent::error(UNKNOWN_USER));

        x.send(&relay, serde_json::json!({ "type": "reconnect", "userId": y_id }))
            .await;
        match next(&mut x.rx).await {
            ServerEvent::Welcome { user_id, .. } => assert_eq!(user_id, y_id),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(x.conn.user(), Some(&y_id));

        let identities = relay.list_identities().await;
        let old = identities.iter().find(|i| i.id == x.id).unwrap();
        assert!(!old.connected);
    }

    #[tokio::test]
    async fn test_set_name_and_get_chat() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let chat_id = create_chat(&relay, &mut x).await;

        x.send(&relay, serde_json::json!({ "type": "setName", "name": "Xavier" }))
            .await;
        assert!(x.rx.try_recv().is_none(), "rename has no reply");

        for n in 0..3 {
            x.send(
                &relay,
                serde_json::json!({ "type": "messageTo", "chatId": chat_id, "text": format!("m{n}") }),
            )
            .await;
            let _echo = next(&mut x.rx).await;
        }

        x.send(&relay, serde_json::json!({ "type": "getChat", "chatId": chat_id }))
            .await;
        match next(&mut x.rx).await {
            ServerEvent::Chat { chat_id: got, participants, messages, .. } => {
                assert_eq!(got, chat_id);
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].name.as_deref(), Some("Xavier"));
                let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
                assert_eq!(texts, vec!["m0", "m1", "m2"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        x.send(
            &relay,
            serde_json::json!({ "type": "getChat", "chatId": chat_id, "limit": 1 }),
        )
        .await;
        match next(&mut x.rx).await {
            ServerEvent::Chat { messages, .. } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].text, "m2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_user_chats() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let chat_id = create_chat(&relay, &mut x).await;

        x.send(&relay, serde_json::json!({ "type": "getMyChats" })).await;
        match next(&mut x.rx).await {
            ServerEvent::UserChats { chats } => {
                assert_eq!(chats.len(), 2);
                assert!(chats.iter().any(|c| c.chat_id == chat_id));
                assert!(chats.iter().any(|c| Some(&c.chat_id) == x.ai_chat.as_ref()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_chat_by_names() {
        let relay = relay();
        let mut x = join(&relay, "10.0.0.1").await;
        let mut y = join(&relay, "10.0.0.2").await;
        y.send(&relay, serde_json::json!({ "type": "setName", "name": "bob" }))
            .await;

        x.send(&relay, serde_json::json!({ "type": "getChatByNames", "names": ["bob"] }))
            .await;
        let first = match next(&mut x.rx).await {
            ServerEvent::Chat { chat_id, participants, messages, .. } => {
                let ids: Vec<UserId> = participants.into_iter().map(|p| p.id).collect();
                assert_eq!(ids.len(), 2);
                assert!(ids.contains(&x.id) && ids.contains(&y.id));
                assert!(messages.is_empty());
                chat_id
            }
            other => panic!("unexpected {other:?}"),
        };

        // Same set from the other side resolves to the same chat.
        y.send(&relay, serde_json::json!({ "type": "setName", "name": "bob" }))
            .await;
        x.send(&relay, serde_json::json!({ "type": "setName", "name": "alice" }))
            .await;
        y.send(&relay, serde_json::json!({ "type": "getChatByNames", "names": ["alice"] }))
            .await;
        match next(&mut y.rx).await {
            ServerEvent::Chat { chat_id, .. } => assert_eq!(chat_id, first),
            other => panic!("unexpected {other:?}"),
        }

        x.send(&relay, serde_json::json!({ "type": "getChatByNames", "names": ["carol"] }))
            .await;
        assert_eq!(
            next(&mut x.rx).await,
            ServerEvent::error("User \"carol\" not found.")
        );
    }
}
