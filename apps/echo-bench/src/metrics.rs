use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::registry::StatsSnapshot;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static PINGS_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("echo_pings_received_total", "Well-formed pings received"),
        &["transport"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PONGS_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("echo_pongs_sent_total", "Pongs written back to clients"),
        &["transport"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PINGS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "echo_pings_dropped_total",
            "Pings dropped because the outbound buffer exceeded the threshold",
        ),
        &["transport"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static MESSAGES_DISCARDED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "echo_messages_discarded_total",
            "Inbound messages ignored without reply",
        ),
        &["transport", "reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static NEGOTIATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("echo_negotiations_total", "Offer/answer sessions by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("echo_connections", "Live connections per transport"),
        &["transport"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static BUFFERED_BYTES: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "echo_buffered_bytes",
            "Outbound bytes queued but not yet sent, per transport",
        ),
        &["transport"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn record_snapshot(snapshot: &StatsSnapshot) {
    CONNECTIONS
        .with_label_values(&["ws"])
        .set(snapshot.persistent_count as i64);
    CONNECTIONS
        .with_label_values(&["rtc"])
        .set(snapshot.peer_count as i64);
    BUFFERED_BYTES
        .with_label_values(&["ws"])
        .set(snapshot.persistent_buffered_bytes as i64);
    BUFFERED_BYTES
        .with_label_values(&["rtc"])
        .set(snapshot.peer_buffered_bytes as i64);
}

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
