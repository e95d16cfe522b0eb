//! In-memory stand-ins for both transports and the peer engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use echo_proto::SessionDescription;

use crate::connection::{ClosedFlag, Connection, ConnectionError, ConnectionId, Frame, TransportKind};
use crate::negotiation::{NegotiationError, PeerEngine, PeerEvents, PeerTransport};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records every frame written to it; buffered bytes are set by the test.
pub struct MockConnection {
    id: ConnectionId,
    kind: TransportKind,
    buffered: AtomicUsize,
    sent: Mutex<Vec<Frame>>,
    closed: ClosedFlag,
}

impl MockConnection {
    pub fn with_id(id: ConnectionId, kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            buffered: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            closed: ClosedFlag::default(),
        })
    }

    pub fn persistent() -> Arc<Self> {
        Self::with_id(ConnectionId::new(), TransportKind::Persistent)
    }

    pub fn peer() -> Arc<Self> {
        Self::with_id(ConnectionId::new(), TransportKind::PeerToPeer)
    }

    pub fn set_buffered(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::Release);
    }

    pub fn sent(&self) -> Vec<Frame> {
        locked(&self.sent).clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.closed.is_set() {
            return Err(ConnectionError::Closed);
        }
        locked(&self.sent).push(frame);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    fn mark_closed(&self) -> bool {
        self.closed.set()
    }
}

pub struct MockPeerTransport {
    answer: Option<SessionDescription>,
    description_reads: AtomicUsize,
    closed: ClosedFlag,
}

impl MockPeerTransport {
    pub fn with_answer(answer: SessionDescription) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(answer),
            description_reads: AtomicUsize::new(0),
            closed: ClosedFlag::default(),
        })
    }

    /// Transport whose gathering never yields a local description.
    pub fn without_answer() -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            description_reads: AtomicUsize::new(0),
            closed: ClosedFlag::default(),
        })
    }

    pub fn description_reads(&self) -> usize {
        self.description_reads.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn local_description(&self) -> Option<SessionDescription> {
        self.description_reads.fetch_add(1, Ordering::AcqRel);
        self.answer.clone()
    }

    async fn close(&self) {
        self.closed.set();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineBehavior {
    /// Reports gathering complete twice from inside `accept`.
    Answer,
    /// Builds the transport but never reports gathering.
    Silent,
    Fail,
}

pub struct MockPeerEngine {
    behavior: EngineBehavior,
    answer: SessionDescription,
    offers: Mutex<Vec<SessionDescription>>,
    last_events: Mutex<Option<PeerEvents>>,
    last_transport: Mutex<Option<Arc<MockPeerTransport>>>,
}

impl MockPeerEngine {
    fn build(behavior: EngineBehavior, answer: SessionDescription) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            answer,
            offers: Mutex::new(Vec::new()),
            last_events: Mutex::new(None),
            last_transport: Mutex::new(None),
        })
    }

    pub fn answering(answer: SessionDescription) -> Arc<Self> {
        Self::build(EngineBehavior::Answer, answer)
    }

    pub fn silent(answer: SessionDescription) -> Arc<Self> {
        Self::build(EngineBehavior::Silent, answer)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(
            EngineBehavior::Fail,
            SessionDescription {
                sdp: String::new(),
                kind: "answer".into(),
            },
        )
    }

    pub fn offers(&self) -> Vec<SessionDescription> {
        locked(&self.offers).clone()
    }

    pub fn last_events(&self) -> Option<PeerEvents> {
        locked(&self.last_events).clone()
    }

    pub fn last_transport(&self) -> Option<Arc<MockPeerTransport>> {
        locked(&self.last_transport).clone()
    }
}

#[async_trait]
impl PeerEngine for MockPeerEngine {
    async fn accept(
        &self,
        remote: SessionDescription,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        locked(&self.offers).push(remote);
        if self.behavior == EngineBehavior::Fail {
            return Err(NegotiationError::Engine("mock engine refused the offer".into()));
        }
        let transport = MockPeerTransport::with_answer(self.answer.clone());
        *locked(&self.last_transport) = Some(transport.clone());
        if self.behavior == EngineBehavior::Answer {
            events.gathering_complete();
            events.gathering_complete();
        }
        *locked(&self.last_events) = Some(events);
        Ok(transport)
    }
}
