use parley_shared::UserId;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No identity is registered under this id.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Every numeric chat code of the configured width is taken.
    #[error("All {digits}-digit chat ids are in use")]
    ChatIdSpaceExhausted { digits: u32 },

    /// A chat was requested with an empty participant set.
    #[error("A chat needs at least one participant")]
    NoParticipants,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
