//! One-shot offer/answer exchange for the peer-to-peer transport.
//!
//! The HTTP side ([`NegotiationOrchestrator::negotiate`]) parses the offer,
//! opens a session on the event loop and hands the remote description to the
//! [`PeerEngine`]. Everything after that arrives as [`NegotiationEvent`]s and
//! is applied by [`Negotiations`] on the event loop, which owns each
//! [`NegotiationSession`] and the keep-alive set of answered transports.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use echo_proto::{ProtoError, SessionDescription};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{ConnectionId, Frame};
use crate::event_loop::LoopHandle;
use crate::metrics;
use crate::registry::{ConnectionRegistry, SharedConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("malformed offer: {0}")]
    MalformedOffer(#[from] ProtoError),
    #[error("unsupported description type `{0}`")]
    UnsupportedType(String),
    #[error("peer engine error: {0}")]
    Engine(String),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Final local description once candidate gathering is complete.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Builds a transport from `remote`, answering it when it is an offer.
    /// Engine callbacks must report through `events` only.
    async fn accept(
        &self,
        remote: SessionDescription,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError>;
}

/// Callback surface handed to the peer engine. Each method enqueues onto the
/// event loop and returns immediately, so it is safe from any engine thread.
#[derive(Clone)]
pub struct PeerEvents {
    session: SessionId,
    handle: LoopHandle,
}

impl PeerEvents {
    pub fn new(session: SessionId, handle: LoopHandle) -> Self {
        Self { session, handle }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn channel_opened(&self, conn: SharedConnection) {
        self.handle.negotiation(NegotiationEvent::ChannelOpened {
            session: self.session,
            conn,
        });
    }

    pub fn channel_message(&self, id: ConnectionId, frame: Frame) {
        self.handle.inbound(id, frame);
    }

    pub fn channel_closed(&self, id: ConnectionId) {
        self.handle.negotiation(NegotiationEvent::ChannelClosed {
            session: self.session,
            id,
        });
    }

    pub fn gathering_complete(&self) {
        self.handle.negotiation(NegotiationEvent::GatheringComplete {
            session: self.session,
        });
    }

    pub fn transport_closed(&self) {
        self.handle.negotiation(NegotiationEvent::TransportClosed {
            session: self.session,
        });
    }
}

pub enum NegotiationEvent {
    Opened {
        session: SessionId,
        responder: oneshot::Sender<SessionDescription>,
    },
    TransportReady {
        session: SessionId,
        transport: Arc<dyn PeerTransport>,
    },
    SetupFailed {
        session: SessionId,
    },
    Aborted {
        session: SessionId,
    },
    GatheringComplete {
        session: SessionId,
    },
    ChannelOpened {
        session: SessionId,
        conn: SharedConnection,
    },
    ChannelClosed {
        session: SessionId,
        id: ConnectionId,
    },
    TransportClosed {
        session: SessionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AwaitingLocalCandidates,
    Completed,
    Aborted,
}

pub struct NegotiationSession {
    id: SessionId,
    state: SessionState,
    responder: Option<oneshot::Sender<SessionDescription>>,
    transport: Option<Arc<dyn PeerTransport>>,
    /// Gathering finished before the engine handed back the transport.
    gathered_early: bool,
    channels: HashSet<ConnectionId>,
    opened_at: Instant,
}

impl NegotiationSession {
    fn new(id: SessionId, responder: oneshot::Sender<SessionDescription>, now: Instant) -> Self {
        Self {
            id,
            state: SessionState::Created,
            responder: Some(responder),
            transport: None,
            gathered_early: false,
            channels: HashSet::new(),
            opened_at: now,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn aborted(&self) -> bool {
        self.state == SessionState::Aborted
    }

    pub fn completed(&self) -> bool {
        self.state == SessionState::Completed
    }

    fn is_pending(&self) -> bool {
        matches!(
            self.state,
            SessionState::Created | SessionState::AwaitingLocalCandidates
        )
    }

    fn abort(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state = SessionState::Aborted;
        true
    }

    /// The single `AwaitingLocalCandidates -> Completed` transition.
    fn complete(&mut self) -> bool {
        if self.state != SessionState::AwaitingLocalCandidates {
            return false;
        }
        self.state = SessionState::Completed;
        true
    }

    fn requester_gone(&self) -> bool {
        self.responder
            .as_ref()
            .map_or(true, |responder| responder.is_closed())
    }
}

struct KeptTransport {
    transport: Arc<dyn PeerTransport>,
    channels: HashSet<ConnectionId>,
    since: Instant,
}

/// Loop-side negotiation state: in-flight sessions plus answered transports
/// kept alive until their data channels close.
pub struct Negotiations {
    sessions: HashMap<SessionId, NegotiationSession>,
    keep_alive: HashMap<SessionId, KeptTransport>,
    session_ttl: Duration,
}

impl Negotiations {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            keep_alive: HashMap::new(),
            session_ttl,
        }
    }

    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(NegotiationSession::state)
    }

    pub fn pending_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn kept_transports(&self) -> usize {
        self.keep_alive.len()
    }

    pub async fn handle(&mut self, event: NegotiationEvent, registry: &mut ConnectionRegistry) {
        match event {
            NegotiationEvent::Opened { session, responder } => {
                debug!(target = "negotiation", session = %session, "session created");
                self.sessions
                    .insert(session, NegotiationSession::new(session, responder, Instant::now()));
            }
            NegotiationEvent::TransportReady { session, transport } => {
                self.on_transport_ready(session, transport, registry).await;
            }
            NegotiationEvent::SetupFailed { session } => {
                if let Some(mut failed) = self.sessions.remove(&session) {
                    failed.abort();
                    metrics::NEGOTIATIONS.with_label_values(&["failed"]).inc();
                }
            }
            NegotiationEvent::Aborted { session } => {
                if let Some(mut aborted) = self.sessions.remove(&session) {
                    aborted.abort();
                    info!(target = "negotiation", session = %session, "requester disconnected before answer");
                    metrics::NEGOTIATIONS.with_label_values(&["aborted"]).inc();
                    Self::release(aborted, registry).await;
                }
            }
            NegotiationEvent::GatheringComplete { session } => {
                self.on_gathering_complete(session, registry).await;
            }
            NegotiationEvent::ChannelOpened { session, conn } => {
                let id = conn.id();
                if let Err(err) = registry.add(conn).await {
                    warn!(target = "negotiation", session = %session, error = %err, "data channel not registered");
                    return;
                }
                info!(target = "negotiation", session = %session, connection = %id, "data channel open");
                if let Some(kept) = self.keep_alive.get_mut(&session) {
                    kept.channels.insert(id);
                } else if let Some(pending) = self.sessions.get_mut(&session) {
                    pending.channels.insert(id);
                }
            }
            NegotiationEvent::ChannelClosed { session, id } => {
                if let Some(conn) = registry.remove(id).await {
                    conn.mark_closed();
                    info!(target = "negotiation", session = %session, connection = %id, "data channel closed");
                }
                if let Some(pending) = self.sessions.get_mut(&session) {
                    pending.channels.remove(&id);
                }
                let drained = match self.keep_alive.get_mut(&session) {
                    Some(kept) => kept.channels.remove(&id) && kept.channels.is_empty(),
                    None => false,
                };
                if drained {
                    if let Some(kept) = self.keep_alive.remove(&session) {
                        kept.transport.close().await;
                        debug!(target = "negotiation", session = %session, "peer transport released");
                    }
                }
            }
            NegotiationEvent::TransportClosed { session } => {
                if let Some(mut pending) = self.sessions.remove(&session) {
                    pending.abort();
                    Self::release(pending, registry).await;
                }
                if let Some(kept) = self.keep_alive.remove(&session) {
                    Self::drop_channels(kept.channels, registry).await;
                    kept.transport.close().await;
                    debug!(target = "negotiation", session = %session, "peer transport closed");
                }
            }
        }
    }

    async fn on_transport_ready(
        &mut self,
        session: SessionId,
        transport: Arc<dyn PeerTransport>,
        registry: &mut ConnectionRegistry,
    ) {
        let Some(pending) = self.sessions.get_mut(&session) else {
            // Aborted or expired while the engine was still building it.
            transport.close().await;
            return;
        };
        if pending.state != SessionState::Created {
            transport.close().await;
            return;
        }
        pending.transport = Some(transport);
        pending.state = SessionState::AwaitingLocalCandidates;
        if pending.gathered_early {
            self.finish(session, registry).await;
        }
    }

    async fn on_gathering_complete(&mut self, session: SessionId, registry: &mut ConnectionRegistry) {
        let Some(pending) = self.sessions.get_mut(&session) else {
            debug!(target = "negotiation", session = %session, "ignoring repeated gathering-complete");
            return;
        };
        let state = pending.state;
        match state {
            SessionState::Created => pending.gathered_early = true,
            SessionState::AwaitingLocalCandidates => self.finish(session, registry).await,
            SessionState::Completed | SessionState::Aborted => {}
        }
    }

    async fn finish(&mut self, session: SessionId, registry: &mut ConnectionRegistry) {
        let Some(mut done) = self.sessions.remove(&session) else {
            return;
        };
        if !done.complete() {
            Self::release(done, registry).await;
            return;
        }
        let Some(transport) = done.transport.take() else {
            Self::release(done, registry).await;
            return;
        };
        if done.requester_gone() {
            info!(target = "negotiation", session = %session, "answer ready but requester is gone");
            metrics::NEGOTIATIONS.with_label_values(&["aborted"]).inc();
            Self::abandon(transport, done.channels, registry).await;
            return;
        }
        let Some(answer) = transport.local_description().await else {
            warn!(target = "negotiation", session = %session, "gathering finished without a local description");
            metrics::NEGOTIATIONS.with_label_values(&["failed"]).inc();
            Self::abandon(transport, done.channels, registry).await;
            return;
        };
        let Some(responder) = done.responder.take() else {
            Self::abandon(transport, done.channels, registry).await;
            return;
        };
        if responder.send(answer).is_err() {
            metrics::NEGOTIATIONS.with_label_values(&["aborted"]).inc();
            Self::abandon(transport, done.channels, registry).await;
            return;
        }
        info!(target = "negotiation", session = %session, "answer delivered");
        metrics::NEGOTIATIONS.with_label_values(&["completed"]).inc();
        self.keep_alive.insert(
            session,
            KeptTransport {
                transport,
                channels: done.channels,
                since: Instant::now(),
            },
        );
    }

    async fn abandon(
        transport: Arc<dyn PeerTransport>,
        channels: HashSet<ConnectionId>,
        registry: &mut ConnectionRegistry,
    ) {
        Self::drop_channels(channels, registry).await;
        transport.close().await;
    }

    async fn release(session: NegotiationSession, registry: &mut ConnectionRegistry) {
        Self::drop_channels(session.channels, registry).await;
        if let Some(transport) = session.transport {
            transport.close().await;
        }
    }

    async fn drop_channels(channels: HashSet<ConnectionId>, registry: &mut ConnectionRegistry) {
        for id in channels {
            if let Some(conn) = registry.remove(id).await {
                conn.mark_closed();
            }
        }
    }

    /// Expires sessions that never completed and answered transports that
    /// never opened a channel.
    pub async fn sweep(&mut self, registry: &mut ConnectionRegistry, now: Instant) {
        let ttl = self.session_ttl;
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| now.saturating_duration_since(session.opened_at) > ttl)
            .map(NegotiationSession::id)
            .collect();
        for id in expired {
            if let Some(mut session) = self.sessions.remove(&id) {
                session.abort();
                warn!(target = "negotiation", session = %id, "session expired before completion");
                metrics::NEGOTIATIONS.with_label_values(&["expired"]).inc();
                Self::release(session, registry).await;
            }
        }

        let idle: Vec<SessionId> = self
            .keep_alive
            .iter()
            .filter(|(_, kept)| {
                kept.channels.is_empty() && now.saturating_duration_since(kept.since) > ttl
            })
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            if let Some(kept) = self.keep_alive.remove(&id) {
                info!(target = "negotiation", session = %id, "closing answered transport that never opened a channel");
                kept.transport.close().await;
            }
        }
    }

    pub async fn shutdown(&mut self, registry: &mut ConnectionRegistry) {
        for (_, session) in self.sessions.drain().collect::<Vec<_>>() {
            Self::drop_channels(session.channels, registry).await;
            if let Some(transport) = session.transport {
                transport.close().await;
            }
        }
        for (_, kept) in self.keep_alive.drain().collect::<Vec<_>>() {
            Self::drop_channels(kept.channels, registry).await;
            kept.transport.close().await;
        }
    }
}

/// Reports requester disconnect to the event loop unless disarmed first.
struct AbortHook {
    session: SessionId,
    handle: LoopHandle,
    armed: bool,
}

impl AbortHook {
    fn arm(session: SessionId, handle: LoopHandle) -> Self {
        Self {
            session,
            handle,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortHook {
    fn drop(&mut self) {
        if self.armed {
            self.handle.negotiation(NegotiationEvent::Aborted {
                session: self.session,
            });
        }
    }
}

#[derive(Clone)]
pub struct NegotiationOrchestrator {
    engine: Arc<dyn PeerEngine>,
    handle: LoopHandle,
}

impl NegotiationOrchestrator {
    pub fn new(engine: Arc<dyn PeerEngine>, handle: LoopHandle) -> Self {
        Self { engine, handle }
    }

    /// Runs one exchange for a raw offer body. `None` means no response must
    /// be written: the offer was malformed, setup failed, or the session was
    /// aborted or expired. Dropping the returned future aborts the session.
    pub async fn negotiate(&self, body: &[u8]) -> Option<SessionDescription> {
        let offer = match SessionDescription::from_json(body) {
            Ok(offer) => offer,
            Err(err) => {
                warn!(target = "negotiation", error = %err, "rejecting malformed offer");
                metrics::NEGOTIATIONS.with_label_values(&["malformed"]).inc();
                return None;
            }
        };

        let session = SessionId::new();
        let (responder, answer) = oneshot::channel();
        if !self
            .handle
            .negotiation(NegotiationEvent::Opened { session, responder })
        {
            return None;
        }
        let abort_hook = AbortHook::arm(session, self.handle.clone());

        let engine = Arc::clone(&self.engine);
        let events = PeerEvents::new(session, self.handle.clone());
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let setup = AssertUnwindSafe(engine.accept(offer, events)).catch_unwind().await;
            match setup {
                Ok(Ok(transport)) => {
                    handle.negotiation(NegotiationEvent::TransportReady { session, transport });
                }
                Ok(Err(err)) => {
                    warn!(target = "negotiation", session = %session, error = %err, "peer setup failed");
                    handle.negotiation(NegotiationEvent::SetupFailed { session });
                }
                Err(_) => {
                    warn!(target = "negotiation", session = %session, "peer setup panicked");
                    handle.negotiation(NegotiationEvent::SetupFailed { session });
                }
            }
        });

        let outcome = answer.await.ok();
        abort_hook.disarm();
        outcome
    }
}
