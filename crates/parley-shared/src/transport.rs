//! Outbound half of a client connection.
//!
//! A [`Transport`] is the handle the session registry stores for a live
//! connection. Cloning it is cheap; every clone feeds the same bounded queue,
//! which the socket writer drains through the paired [`TransportReceiver`].
//! Closing a transport stops further sends and ends the receiver once the
//! events already queued (for example a `banned` notice) have been drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::SendError;
use crate::protocol::ServerEvent;

/// Identifies one client connection; every transport gets its own.
pub type ConnectionId = Uuid;

#[derive(Debug, Default)]
struct CloseState {
    closed: AtomicBool,
    signal: Notify,
}

#[derive(Debug, Clone)]
pub struct Transport {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
    state: Arc<CloseState>,
}

#[derive(Debug)]
pub struct TransportReceiver {
    rx: mpsc::Receiver<ServerEvent>,
    state: Arc<CloseState>,
}

impl Transport {
    /// Create a transport whose queue holds at most `capacity` events.
    pub fn channel(capacity: usize) -> (Transport, TransportReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let state = Arc::new(CloseState::default());
        let transport = Transport {
            id: Uuid::new_v4(),
            tx,
            state: state.clone(),
        };
        (transport, TransportReceiver { rx, state })
    }

    /// Connection id, distinct for every call to [`Transport::channel`].
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.state.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue an event without waiting.
    pub fn send(&self, event: ServerEvent) -> Result<(), SendError> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Close the transport. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let first = !self.state.closed.swap(true, Ordering::AcqRel);
        if first {
            self.state.signal.notify_one();
        }
        first
    }
}

impl TransportReceiver {
    /// Next queued event, or `None` once the transport is closed and drained.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        loop {
            if let Ok(event) = self.rx.try_recv() {
                return Some(event);
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            tokio::select! {
                event = self.rx.recv() => return event,
                _ = self.state.signal.notified() => continue,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}
