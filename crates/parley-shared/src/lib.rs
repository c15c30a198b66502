//! # parley-shared
//!
//! Types shared by every Parley crate: identifiers, the JSON wire protocol
//! spoken over the client socket, and the transport handle the relay uses to
//! push events to a connection.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod types;

pub use error::{ProtocolError, SendError};
pub use protocol::{ChatMessage, ChatSummary, ClientEvent, Inbound, ParticipantInfo, ServerEvent};
pub use transport::{Transport, TransportReceiver};
pub use types::{ChatId, MessageId, UserId};
