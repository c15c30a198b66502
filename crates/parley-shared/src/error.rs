use thiserror::Error;

/// A client frame that could not be turned into a [`ClientEvent`](crate::ClientEvent).
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Malformed '{kind}' event: {source}")]
    Shape {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// Whether the frame was at least a JSON object.
    ///
    /// Such frames still count as "an inbound event" for identity
    /// establishment even when their shape is wrong.
    pub fn is_object(&self) -> bool {
        matches!(self, ProtocolError::Shape { .. })
    }
}

/// Why an event could not be queued on a transport.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("Transport closed")]
    Closed,

    #[error("Send queue full")]
    Full,
}
