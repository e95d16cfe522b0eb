//! Persistent (WebSocket) transport.
//!
//! Each socket is split: a writer task drains an unbounded queue into the
//! sink, while the reader forwards frames to the event loop. Bytes sitting in
//! the queue are what [`WsConnection::buffered_bytes`] reports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::connection::{ClosedFlag, Connection, ConnectionError, ConnectionId, Frame, TransportKind};
use crate::event_loop::LoopHandle;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(16);

#[derive(Debug, Clone, Copy)]
pub struct WsSettings {
    pub max_message_size: usize,
    /// Zero disables both the keepalive ping and the idle close.
    pub idle_timeout: Duration,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

pub struct WsConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
    buffered: Arc<AtomicUsize>,
    closed: ClosedFlag,
}

impl WsConnection {
    fn new(tx: mpsc::UnboundedSender<Message>, buffered: Arc<AtomicUsize>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            buffered,
            closed: ClosedFlag::default(),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Persistent
    }

    async fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.closed.is_set() {
            return Err(ConnectionError::Closed);
        }
        let len = frame.len();
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes.to_vec()),
        };
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(message).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    fn mark_closed(&self) -> bool {
        self.closed.set()
    }
}

fn queued_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

/// Drains `rx` into `sink`, interleaving keepalive pings. Stops when the
/// queue closes or the sink errors.
async fn write_loop<S>(
    id: ConnectionId,
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Message>,
    buffered: Arc<AtomicUsize>,
    keepalive: Option<Duration>,
) where
    S: Sink<Message> + Unpin,
{
    let period = keepalive.unwrap_or(Duration::from_secs(3600));
    let mut ping = interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                let len = queued_len(&message);
                let result = sink.send(message).await;
                buffered.fetch_sub(len, Ordering::AcqRel);
                if result.is_err() {
                    debug!(target = "ws", connection = %id, "socket write failed");
                    break;
                }
            }
            _ = ping.tick(), if keepalive.is_some() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
    trace!(target = "ws", connection = %id, "writer stopped");
}

pub async fn serve_socket(socket: WebSocket, handle: LoopHandle, settings: WsSettings) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let conn = Arc::new(WsConnection::new(tx, buffered.clone()));
    let id = conn.id();

    let idle = (!settings.idle_timeout.is_zero()).then_some(settings.idle_timeout);
    tokio::spawn(write_loop(id, sink, rx, buffered, idle.map(|d| d / 2)));

    if !handle.register(conn) {
        return;
    }
    info!(target = "ws", connection = %id, "websocket open");

    loop {
        let next = match idle {
            Some(limit) => match timeout(limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    info!(target = "ws", connection = %id, "closing idle websocket");
                    break;
                }
            },
            None => stream.next().await,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(target = "ws", connection = %id, error = %err, "websocket read failed");
                break;
            }
            None => break,
        };
        match message {
            Message::Text(text) => {
                handle.inbound(id, Frame::Text(text));
            }
            Message::Binary(data) => {
                handle.inbound(id, Frame::Binary(Bytes::from(data)));
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    handle.unregister(id);
    info!(target = "ws", connection = %id, "websocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    fn connection() -> (Arc<WsConnection>, mpsc::UnboundedReceiver<Message>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        (Arc::new(WsConnection::new(tx, buffered.clone())), rx, buffered)
    }

    #[tokio::test]
    async fn queued_frames_count_as_buffered() {
        let (conn, mut rx, _) = connection();
        conn.send(Frame::Text("12345".into())).await.unwrap();
        conn.send(Frame::Binary(Bytes::from_static(b"abc"))).await.unwrap();
        assert_eq!(conn.buffered_bytes().await, 8);

        assert_eq!(rx.recv().await, Some(Message::Text("12345".into())));
        assert_eq!(rx.recv().await, Some(Message::Binary(b"abc".to_vec())));
    }

    #[tokio::test]
    async fn writer_drains_the_buffer() {
        let (conn, rx, buffered) = connection();
        conn.send(Frame::Text("hello".into())).await.unwrap();
        let id = conn.id();
        drop(conn);

        let written: Vec<Message> = Vec::new();
        let sink = sink::unfold(written, |mut acc, msg: Message| async move {
            acc.push(msg);
            Ok::<_, std::convert::Infallible>(acc)
        });
        write_loop(id, Box::pin(sink), rx, buffered.clone(), None).await;
        assert_eq!(buffered.load(Ordering::Acquire), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_sends_keepalive_pings() {
        let (conn, rx, buffered) = connection();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let sink = sink::unfold(out_tx, |out, msg: Message| async move {
            out.send(msg).map_err(|_| ())?;
            Ok::<_, ()>(out)
        });
        let period = Duration::from_secs(8);
        let started = Instant::now();
        let writer = tokio::spawn(write_loop(conn.id(), Box::pin(sink), rx, buffered, Some(period)));

        assert_eq!(out_rx.recv().await, Some(Message::Ping(Vec::new())));
        assert!(started.elapsed() >= period);
        assert_eq!(out_rx.recv().await, Some(Message::Ping(Vec::new())));
        assert!(started.elapsed() >= period * 2);

        drop(conn);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn send_after_close_fails_without_buffering() {
        let (conn, rx, _) = connection();
        conn.mark_closed();
        assert!(matches!(
            conn.send(Frame::Text("x".into())).await,
            Err(ConnectionError::Closed)
        ));
        drop(rx);

        let (open, rx, _) = connection();
        drop(rx);
        assert!(open.send(Frame::Text("x".into())).await.is_err());
        assert_eq!(open.buffered_bytes().await, 0);
    }
}
