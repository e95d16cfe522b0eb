//! `echo-bench ping`: a WebSocket load generator that reports round-trip times.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use echo_proto::{PingMessage, PongMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use crate::cli::PingArgs;
use crate::echo::now_millis;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttSummary {
    pub min_ms: f64,
    pub median_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl RttSummary {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        Some(Self {
            min_ms: sorted[0],
            median_ms: percentile(&sorted, 50.0),
            p99_ms: percentile(&sorted, 99.0),
            max_ms: sorted[sorted.len() - 1],
        })
    }
}

/// Nearest-rank percentile over an ascending, non-empty slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, Default)]
pub struct PingReport {
    pub sent: u32,
    pub received: u32,
    pub rtts_ms: Vec<f64>,
}

impl PingReport {
    pub fn lost(&self) -> u32 {
        self.sent.saturating_sub(self.received)
    }

    pub fn summary(&self) -> Option<RttSummary> {
        RttSummary::from_samples(&self.rtts_ms)
    }
}

impl fmt::Display for PingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {} received {} lost {}",
            self.sent,
            self.received,
            self.lost()
        )?;
        if let Some(summary) = self.summary() {
            write!(
                f,
                " | rtt min {:.3}ms median {:.3}ms p99 {:.3}ms max {:.3}ms",
                summary.min_ms, summary.median_ms, summary.p99_ms, summary.max_ms
            )?;
        }
        Ok(())
    }
}

fn build_ping(seq: u32, padding: usize) -> PingMessage {
    let ping = PingMessage::new(now_millis()).with_field("id", seq);
    if padding == 0 {
        ping
    } else {
        ping.with_field("payload", "x".repeat(padding))
    }
}

pub async fn run(args: &PingArgs) -> Result<PingReport> {
    let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(args.url.as_str()))
        .await
        .with_context(|| format!("timed out connecting to {}", args.url))?
        .with_context(|| format!("failed to connect to {}", args.url))?;
    info!(target = "ping", url = %args.url, count = args.count, "connected");
    let (mut write, mut read) = stream.split();

    let mut report = PingReport::default();
    let mut in_flight: HashMap<u64, Instant> = HashMap::new();
    let mut ticker = interval(Duration::from_millis(args.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut drain_deadline: Option<Instant> = None;

    loop {
        if report.sent == args.count && in_flight.is_empty() {
            break;
        }
        let deadline = drain_deadline;
        let drain = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = ticker.tick(), if report.sent < args.count => {
                let seq = report.sent;
                let text = serde_json::to_string(&build_ping(seq, args.payload))?;
                in_flight.insert(u64::from(seq), Instant::now());
                write.send(Message::Text(text.into())).await.context("ping send failed")?;
                report.sent += 1;
                if report.sent == args.count {
                    drain_deadline = Some(Instant::now() + Duration::from_millis(args.drain_ms));
                }
            }
            frame = read.next() => {
                let Some(frame) = frame else {
                    bail!("server closed the connection after {} pings", report.sent);
                };
                let payload = match frame.context("websocket read failed")? {
                    Message::Text(text) => text.as_str().as_bytes().to_vec(),
                    Message::Binary(data) => data.to_vec(),
                    Message::Close(_) => bail!("server closed the connection"),
                    _ => continue,
                };
                if let Some(rtt) = match_pong(&payload, &mut in_flight) {
                    report.received += 1;
                    report.rtts_ms.push(rtt);
                }
            }
            _ = drain => {
                debug!(target = "ping", outstanding = in_flight.len(), "drain window elapsed");
                break;
            }
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(report)
}

/// Returns the round trip in milliseconds for a pong answering an in-flight ping.
fn match_pong(raw: &[u8], in_flight: &mut HashMap<u64, Instant>) -> Option<f64> {
    let pong: PongMessage = serde_json::from_slice(raw).ok()?;
    if pong.kind != echo_proto::PONG {
        return None;
    }
    let seq = pong.echoed.get("id")?.as_u64()?;
    let sent_at = in_flight.remove(&seq)?;
    Some(sent_at.elapsed().as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_uses_nearest_rank() {
        let samples: Vec<f64> = (1..=100u32).map(f64::from).collect();
        let summary = RttSummary::from_samples(&samples).unwrap();
        assert_eq!(summary.min_ms, 1.0);
        assert_eq!(summary.median_ms, 50.0);
        assert_eq!(summary.p99_ms, 99.0);
        assert_eq!(summary.max_ms, 100.0);

        let single = RttSummary::from_samples(&[4.5]).unwrap();
        assert_eq!(single.p99_ms, 4.5);
        assert!(RttSummary::from_samples(&[]).is_none());
    }

    #[test]
    fn report_counts_losses() {
        let report = PingReport {
            sent: 10,
            received: 7,
            rtts_ms: vec![1.0; 7],
        };
        assert_eq!(report.lost(), 3);
        assert!(report.to_string().starts_with("sent 10 received 7 lost 3 | rtt min 1.000ms"));
    }

    #[test]
    fn only_pongs_for_outstanding_pings_count() {
        let mut in_flight = HashMap::new();
        in_flight.insert(3u64, Instant::now());

        let stray = br#"{"type":"pong","client_ts":1,"server_ts":2,"id":9}"#;
        assert!(match_pong(stray, &mut in_flight).is_none());
        assert!(match_pong(br#"{"type":"ping","ts":1,"id":3}"#, &mut in_flight).is_none());

        let answer = br#"{"type":"pong","client_ts":1,"server_ts":2,"id":3}"#;
        assert!(match_pong(answer, &mut in_flight).is_some());
        assert!(in_flight.is_empty());
        assert!(match_pong(answer, &mut in_flight).is_none());
    }

    #[test]
    fn padding_is_optional() {
        let plain = build_ping(1, 0);
        assert!(!plain.extra.contains_key("payload"));
        let padded = build_ping(2, 16);
        assert_eq!(padded.extra["payload"].as_str().map(str::len), Some(16));
        assert_eq!(padded.extra["id"], serde_json::json!(2));
    }
}
