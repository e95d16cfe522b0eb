//! Single owner of connection state.
//!
//! Every registry mutation and every outbound write happens inside
//! [`EventLoop::run`]. Other tasks (WebSocket readers, WebRTC callbacks, the
//! stats timer) talk to it only by enqueueing a [`LoopCommand`] through a
//! [`LoopHandle`], so per-connection writes are strictly sequential.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionId, Frame};
use crate::echo::EchoHandler;
use crate::negotiation::{NegotiationEvent, Negotiations};
use crate::registry::{ConnectionRegistry, SharedConnection, StatsSnapshot};

pub enum LoopCommand {
    Register(SharedConnection),
    Unregister(ConnectionId),
    Inbound { id: ConnectionId, frame: Frame },
    Negotiation(NegotiationEvent),
    Snapshot(oneshot::Sender<StatsSnapshot>),
    Shutdown,
}

#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopCommand>,
}

impl LoopHandle {
    /// Enqueues `command`; returns false once the loop has stopped.
    pub fn defer(&self, command: LoopCommand) -> bool {
        if self.tx.send(command).is_err() {
            trace!(target = "event_loop", "command dropped: loop stopped");
            return false;
        }
        true
    }

    pub fn register(&self, conn: SharedConnection) -> bool {
        self.defer(LoopCommand::Register(conn))
    }

    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.defer(LoopCommand::Unregister(id))
    }

    pub fn inbound(&self, id: ConnectionId, frame: Frame) -> bool {
        self.defer(LoopCommand::Inbound { id, frame })
    }

    pub fn negotiation(&self, event: NegotiationEvent) -> bool {
        self.defer(LoopCommand::Negotiation(event))
    }

    pub async fn snapshot(&self) -> Option<StatsSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.defer(LoopCommand::Snapshot(reply)) {
            return None;
        }
        rx.await.ok()
    }

    pub fn shutdown(&self) -> bool {
        self.defer(LoopCommand::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventLoopConfig {
    pub echo: EchoHandler,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            echo: EchoHandler::default(),
            session_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

pub struct EventLoop {
    registry: ConnectionRegistry,
    echo: EchoHandler,
    negotiations: Negotiations,
    sweep_interval: Duration,
    rx: mpsc::UnboundedReceiver<LoopCommand>,
}

impl EventLoop {
    pub fn new(config: EventLoopConfig) -> (Self, LoopHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let event_loop = Self {
            registry: ConnectionRegistry::new(),
            echo: config.echo,
            negotiations: Negotiations::new(config.session_ttl),
            sweep_interval: config.sweep_interval,
            rx,
        };
        (event_loop, LoopHandle { tx })
    }

    pub fn spawn(config: EventLoopConfig) -> (LoopHandle, JoinHandle<()>) {
        let (event_loop, handle) = Self::new(config);
        (handle, tokio::spawn(event_loop.run()))
    }

    pub async fn run(mut self) {
        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            target = "event_loop",
            backpressure = self.echo.policy().enabled,
            threshold = self.echo.policy().threshold,
            "event loop started"
        );
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    if self.dispatch(command).await.is_break() {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    self.negotiations.sweep(&mut self.registry, Instant::now()).await;
                }
            }
        }
        info!(target = "event_loop", "event loop stopped");
    }

    async fn dispatch(&mut self, command: LoopCommand) -> ControlFlow<()> {
        match command {
            LoopCommand::Register(conn) => {
                let id = conn.id();
                let transport = conn.kind().as_str();
                match self.registry.add(conn).await {
                    Ok(()) => debug!(target = "event_loop", connection = %id, transport, "connection registered"),
                    Err(err) => warn!(target = "event_loop", error = %err, "register rejected"),
                }
            }
            LoopCommand::Unregister(id) => {
                if let Some(conn) = self.registry.remove(id).await {
                    conn.mark_closed();
                    debug!(target = "event_loop", connection = %id, "connection unregistered");
                }
            }
            LoopCommand::Inbound { id, frame } => match self.registry.get(id).await {
                Some(conn) => {
                    self.echo.on_message(conn.as_ref(), &frame).await;
                }
                None => trace!(target = "event_loop", connection = %id, "message for unknown connection"),
            },
            LoopCommand::Negotiation(event) => {
                self.negotiations.handle(event, &mut self.registry).await;
            }
            LoopCommand::Snapshot(reply) => {
                let _ = reply.send(self.registry.snapshot().await);
            }
            LoopCommand::Shutdown => {
                self.negotiations.shutdown(&mut self.registry).await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressurePolicy;
    use crate::connection::Connection;
    use crate::mock::MockConnection;

    #[tokio::test]
    async fn inbound_ping_is_answered_on_the_same_connection() {
        let (handle, _task) = EventLoop::spawn(EventLoopConfig::default());
        let target = MockConnection::persistent();
        let bystander = MockConnection::persistent();
        handle.register(target.clone());
        handle.register(bystander.clone());

        handle.inbound(target.id(), Frame::Text(r#"{"type":"ping","ts":1000}"#.into()));
        // Snapshot is queued behind the ping, so the ping has been handled once it returns.
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.persistent_count, 2);

        assert_eq!(target.sent().len(), 1);
        assert!(bystander.sent().is_empty());
    }

    #[tokio::test]
    async fn unregister_marks_closed_and_stops_echo() {
        let (handle, _task) = EventLoop::spawn(EventLoopConfig::default());
        let conn = MockConnection::peer();
        handle.register(conn.clone());
        handle.unregister(conn.id());
        handle.inbound(conn.id(), Frame::Text(r#"{"type":"ping","ts":1}"#.into()));

        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.is_idle());
        assert!(conn.is_closed());
        assert!(conn.sent().is_empty());
    }

    #[tokio::test]
    async fn backpressure_policy_is_applied_by_the_loop() {
        let (handle, _task) = EventLoop::spawn(EventLoopConfig {
            echo: EchoHandler::new(BackpressurePolicy {
                enabled: true,
                threshold: 10,
            }),
            ..EventLoopConfig::default()
        });
        let conn = MockConnection::persistent();
        conn.set_buffered(11);
        handle.register(conn.clone());
        handle.inbound(conn.id(), Frame::Text(r#"{"type":"ping","ts":1}"#.into()));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.persistent_buffered_bytes, 11);
        assert!(conn.sent().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let (handle, task) = EventLoop::spawn(EventLoopConfig::default());
        assert!(handle.shutdown());
        task.await.unwrap();
        assert!(handle.snapshot().await.is_none());
    }
}
