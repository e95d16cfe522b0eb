//! Wire types shared by the echo-bench server and its clients.
//! Kept free of runtime dependencies so load generators in other languages
//! can be checked against the same schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// Keys the pong sets itself; a ping's own copies are never echoed.
const PONG_KEYS: [&str; 3] = ["type", "client_ts", "server_ts"];

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no `type` field")]
    MissingType,
    #[error("`type` field is not a string")]
    InvalidType,
    #[error("ping has no integer `ts` field")]
    MissingTimestamp,
}

/// An inbound frame after envelope inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ping(PingMessage),
    /// Well-formed envelope carrying a type the benchmark does not answer.
    Unsupported(String),
}

impl Inbound {
    pub fn parse(raw: &[u8]) -> Result<Self, ProtoError> {
        let mut object: Map<String, Value> = serde_json::from_slice(raw)?;
        let kind = match object.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(_) => return Err(ProtoError::InvalidType),
            None => return Err(ProtoError::MissingType),
        };
        if kind != PING {
            return Ok(Inbound::Unsupported(kind));
        }
        let ts = object
            .remove("ts")
            .and_then(|value| value.as_i64())
            .ok_or(ProtoError::MissingTimestamp)?;
        Ok(Inbound::Ping(PingMessage {
            kind,
            ts,
            extra: object,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    /// Client-defined fields (sequence id, padding) echoed back in the pong.
    /// `ts` itself is not among them; the pong carries it as `client_ts`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PingMessage {
    pub fn new(ts: i64) -> Self {
        Self {
            kind: PING.to_string(),
            ts,
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_ts: i64,
    pub server_ts: i64,
    #[serde(flatten)]
    pub echoed: Map<String, Value>,
}

impl PongMessage {
    pub fn reply(ping: &PingMessage, server_ts: i64) -> Self {
        let mut echoed = ping.extra.clone();
        for key in PONG_KEYS {
            echoed.remove(key);
        }
        Self {
            kind: PONG.to_string(),
            client_ts: ping.ts,
            server_ts,
            echoed,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// SDP payload exchanged on `POST /offer`, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionDescription {
    pub fn from_json(body: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn is_offer(&self) -> bool {
        self.kind.eq_ignore_ascii_case("offer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ping_and_keeps_extra_fields() {
        let raw = br#"{"type":"ping","ts":1000,"id":7,"payload":"xx"}"#;
        let Inbound::Ping(ping) = Inbound::parse(raw).unwrap() else {
            panic!("expected ping");
        };
        assert_eq!(ping.ts, 1000);
        assert_eq!(ping.extra.get("id"), Some(&json!(7)));
        assert!(!ping.extra.contains_key("type"));
        assert!(!ping.extra.contains_key("ts"));
    }

    #[test]
    fn rejects_malformed_envelopes() {
        assert!(matches!(Inbound::parse(b"not json"), Err(ProtoError::Json(_))));
        assert!(matches!(Inbound::parse(b"[1,2]"), Err(ProtoError::Json(_))));
        assert!(matches!(
            Inbound::parse(br#"{"ts":1}"#),
            Err(ProtoError::MissingType)
        ));
        assert!(matches!(
            Inbound::parse(br#"{"type":5,"ts":1}"#),
            Err(ProtoError::InvalidType)
        ));
        assert!(matches!(
            Inbound::parse(br#"{"type":"ping","ts":"soon"}"#),
            Err(ProtoError::MissingTimestamp)
        ));
    }

    #[test]
    fn other_types_are_unsupported_not_errors() {
        let parsed = Inbound::parse(br#"{"type":"pong","client_ts":1}"#).unwrap();
        assert_eq!(parsed, Inbound::Unsupported("pong".into()));
    }

    #[test]
    fn pong_wire_shape() {
        let ping = PingMessage::new(1000).with_field("id", 3);
        let pong = PongMessage::reply(&ping, 1005);
        let value: Value = serde_json::from_str(&pong.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "pong", "client_ts": 1000, "server_ts": 1005, "id": 3})
        );
    }

    #[test]
    fn pong_timestamps_win_over_ping_fields() {
        let raw = br#"{"type":"ping","ts":1000,"client_ts":5,"server_ts":6,"id":2}"#;
        let Inbound::Ping(ping) = Inbound::parse(raw).unwrap() else {
            panic!("expected ping");
        };
        let wire = PongMessage::reply(&ping, 2000).to_json().unwrap();
        assert_eq!(wire.matches("client_ts").count(), 1, "{wire}");
        assert_eq!(wire.matches("server_ts").count(), 1, "{wire}");

        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(
            value,
            json!({"type": "pong", "client_ts": 1000, "server_ts": 2000, "id": 2})
        );
    }

    #[test]
    fn ts_is_not_echoed_twice() {
        let ping = PingMessage::new(42).with_field("payload", "xx");
        let value: Value =
            serde_json::from_str(&PongMessage::reply(&ping, 50).to_json().unwrap()).unwrap();
        assert_eq!(value.get("ts"), None);
        assert_eq!(value["client_ts"], 42);
    }

    #[test]
    fn offer_body_requires_string_fields() {
        let offer = SessionDescription::from_json(br#"{"sdp":"v=0","type":"offer"}"#).unwrap();
        assert!(offer.is_offer());
        assert!(SessionDescription::from_json(br#"{"sdp":"v=0"}"#).is_err());
        assert!(SessionDescription::from_json(br#"{"sdp":1,"type":"offer"}"#).is_err());
        assert!(SessionDescription::from_json(b"not json").is_err());
    }
}
