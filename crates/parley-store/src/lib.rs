//! # parley-store
//!
//! In-memory state of the Parley relay.
//!
//! Two owned components, each created per relay instance and handed to the
//! protocol handler by the caller:
//!
//! - [`SessionRegistry`]: identities, their live transport, display name,
//!   network address, and the ban lists.
//! - [`ChatStore`]: chats, their participant sets, and per-chat message logs
//!   in insertion order.
//!
//! Nothing here is persisted; a restart starts from an empty state.

pub mod chats;
pub mod models;
pub mod sessions;

mod error;

pub use chats::ChatStore;
pub use error::{Result, StoreError};
pub use models::*;
pub use sessions::SessionRegistry;
