/// Application name
pub const APP_NAME: &str = "Parley";

/// Participant id of the synthetic AI companion
pub const AI_PARTICIPANT: &str = "AI";

/// Prefix of generated default display names
pub const GUEST_NAME_PREFIX: &str = "Guest_";

/// Number of id characters appended to a generated display name
pub const GUEST_NAME_SUFFIX_LEN: usize = 4;

/// Messages returned by a history request without an explicit limit
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Width of the human-shareable numeric chat code
pub const DEFAULT_CHAT_ID_DIGITS: u32 = 5;

/// Widest numeric chat code that still fits the id generator
pub const MAX_CHAT_ID_DIGITS: u32 = 9;

/// Hex characters kept from a participant-set digest
pub const DERIVED_CHAT_ID_LEN: usize = 16;

/// Outbound events buffered per connection before fan-out starts dropping
pub const DEFAULT_SEND_QUEUE: usize = 256;

/// Default HTTP port (server)
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Reply text used whenever the reply generator cannot produce an answer
pub const AI_APOLOGY: &str = "Sorry, I could not generate a reply.";

/// Reason sent to connections from a banned address
pub const BANNED_REASON: &str = "You have been banned.";
