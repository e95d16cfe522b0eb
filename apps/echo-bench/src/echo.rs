use echo_proto::{Inbound, PongMessage};
use tracing::{debug, trace};

use crate::backpressure::BackpressurePolicy;
use crate::connection::{Connection, Frame};
use crate::metrics;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    Ponged,
    /// Valid ping, but the connection was over the backpressure threshold.
    Dropped,
    /// Malformed, not a ping, or the write failed.
    Ignored,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler {
    policy: BackpressurePolicy,
}

impl EchoHandler {
    pub fn new(policy: BackpressurePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Performs at most one write, always to `conn`.
    pub async fn on_message(&self, conn: &dyn Connection, frame: &Frame) -> EchoOutcome {
        let transport = conn.kind().as_str();
        let ping = match Inbound::parse(frame.as_bytes()) {
            Ok(Inbound::Ping(ping)) => ping,
            Ok(Inbound::Unsupported(kind)) => {
                trace!(connection = %conn.id(), kind = %kind, "ignoring non-ping message");
                metrics::MESSAGES_DISCARDED
                    .with_label_values(&[transport, "unsupported"])
                    .inc();
                return EchoOutcome::Ignored;
            }
            Err(err) => {
                trace!(connection = %conn.id(), error = %err, "discarding malformed message");
                metrics::MESSAGES_DISCARDED
                    .with_label_values(&[transport, "malformed"])
                    .inc();
                return EchoOutcome::Ignored;
            }
        };
        metrics::PINGS_RECEIVED.with_label_values(&[transport]).inc();

        let buffered = conn.buffered_bytes().await;
        if !self.policy.should_send(buffered) {
            trace!(connection = %conn.id(), buffered, "backpressure: dropping pong");
            metrics::PINGS_DROPPED.with_label_values(&[transport]).inc();
            return EchoOutcome::Dropped;
        }

        let pong = PongMessage::reply(&ping, now_millis());
        let text = match pong.to_json() {
            Ok(text) => text,
            Err(err) => {
                debug!(connection = %conn.id(), error = %err, "failed to encode pong");
                return EchoOutcome::Ignored;
            }
        };
        match conn.send(frame.reply_with(text)).await {
            Ok(()) => {
                metrics::PONGS_SENT.with_label_values(&[transport]).inc();
                EchoOutcome::Ponged
            }
            Err(err) => {
                debug!(connection = %conn.id(), error = %err, "pong write failed");
                EchoOutcome::Ignored
            }
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
