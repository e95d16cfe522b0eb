use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::event_loop::LoopHandle;
use crate::metrics;
use crate::registry::StatsSnapshot;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

pub trait StatsSink: Send + 'static {
    fn report(&mut self, snapshot: &StatsSnapshot);
}

/// Emits the periodic buffered-bytes line.
#[derive(Debug, Default)]
pub struct LogSink;

impl StatsSink for LogSink {
    fn report(&mut self, snapshot: &StatsSnapshot) {
        info!(
            target = "stats",
            ws_connections = snapshot.persistent_count,
            ws_buffered = snapshot.persistent_buffered_bytes,
            rtc_connections = snapshot.peer_count,
            rtc_buffered = snapshot.peer_buffered_bytes,
            "{snapshot}"
        );
    }
}

/// Samples the registry on the event loop every `period`. Gauges are updated
/// on every tick; the sink only sees snapshots with live connections.
pub struct StatsCollector<S> {
    handle: LoopHandle,
    period: Duration,
    sink: S,
}

impl<S: StatsSink> StatsCollector<S> {
    pub fn new(handle: LoopHandle, period: Duration, sink: S) -> Self {
        Self {
            handle,
            period,
            sink,
        }
    }

    /// Runs until the event loop stops.
    pub async fn run(mut self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(snapshot) = self.handle.snapshot().await else {
                break;
            };
            metrics::record_snapshot(&snapshot);
            if !snapshot.is_idle() {
                self.sink.report(&snapshot);
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
