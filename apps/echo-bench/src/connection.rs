use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

/// Opaque identity of one live transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Persistent,
    PeerToPeer,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Persistent => "ws",
            TransportKind::PeerToPeer => "rtc",
        }
    }
}

/// A single message as it crossed the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds a reply carrying `text`, framed the same way as `self`.
    pub fn reply_with(&self, text: String) -> Frame {
        match self {
            Frame::Text(_) => Frame::Text(text),
            Frame::Binary(_) => Frame::Binary(Bytes::from(text)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Write-once closed marker shared by every connection implementation.
#[derive(Debug, Default)]
pub struct ClosedFlag(AtomicBool);

impl ClosedFlag {
    /// Returns true only for the call that performed the transition.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn kind(&self) -> TransportKind;

    /// Bytes accepted for sending but not yet handed to the network.
    async fn buffered_bytes(&self) -> usize;

    async fn send(&self, frame: Frame) -> Result<(), ConnectionError>;

    fn is_closed(&self) -> bool;

    fn mark_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_flag_transitions_once() {
        let flag = ClosedFlag::default();
        assert!(!flag.is_set());
        assert!(flag.set());
        assert!(!flag.set());
        assert!(flag.is_set());
    }

    #[test]
    fn reply_mirrors_frame_kind() {
        let text = Frame::Text("a".into()).reply_with("b".into());
        assert_eq!(text, Frame::Text("b".into()));
        let binary = Frame::Binary(Bytes::from_static(b"a")).reply_with("b".into());
        assert_eq!(binary, Frame::Binary(Bytes::from_static(b"b")));
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
