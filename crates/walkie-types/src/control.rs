use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::frame::Seq;

/// Discriminant for the ad hoc JSON control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Enter,
    Ping,
    Pong,
    Leave,
}

/// A directory entry as advertised by the relay or a peer's `enter`/`pong`
/// reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub addr: SocketAddr,
}

/// Optional tempo-gossip payload piggybacked on `ping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempoInfo {
    pub bpm: u32,
    pub start: i64,
    pub owner: String,
    pub seq: Seq,
}

/// The full set of fields any control message might carry. Every message
/// carries `from`/`seq`; the rest are populated per `kind`. Modeled as one
/// loosely-typed struct rather than a strict per-variant enum, matching the
/// wire format peers actually exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    pub seq: Seq,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ping_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub youare: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub clients: Option<Vec<ClientInfo>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tempo: Option<TempoInfo>,
}

impl ControlMessage {
    pub fn new(kind: MessageKind, from: impl Into<String>, seq: Seq) -> Self {
        Self {
            kind,
            from: from.into(),
            seq,
            time: None,
            ping_time: None,
            youare: None,
            clients: None,
            tempo: None,
        }
    }

    pub fn enter(from: impl Into<String>, seq: Seq) -> Self {
        Self::new(MessageKind::Enter, from, seq)
    }

    pub fn leave(from: impl Into<String>, seq: Seq) -> Self {
        Self::new(MessageKind::Leave, from, seq)
    }

    pub fn ping(from: impl Into<String>, seq: Seq, time: i64) -> Self {
        let mut m = Self::new(MessageKind::Ping, from, seq);
        m.time = Some(time);
        m
    }

    pub fn pong(from: impl Into<String>, seq: Seq, ping_time: i64, time: i64) -> Self {
        let mut m = Self::new(MessageKind::Pong, from, seq);
        m.ping_time = Some(ping_time);
        m.time = Some(time);
        m
    }

    pub fn with_tempo(mut self, tempo: TempoInfo) -> Self {
        self.tempo = Some(tempo);
        self
    }
}

/// Classify an inbound datagram as JSON control or binary audio: binary
/// unless the payload both starts with `{` and ends with `}`.
pub fn is_json_control(data: &[u8]) -> bool {
    matches!((data.first(), data.last()), (Some(b'{'), Some(b'}')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_wire_rule() {
        assert!(is_json_control(b"{\"type\":\"ping\"}"));
        assert!(!is_json_control(b""));
        assert!(!is_json_control(b"{not json"));
        assert!(!is_json_control(&[0x01, 0x02, 0x03]));
    }

    #[test]
    fn control_message_round_trips_through_json() {
        let msg = ControlMessage::ping("alice", 7, 1234);
        let json = serde_json::to_vec(&msg).unwrap();
        assert!(is_json_control(&json));
        let back: ControlMessage = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.from, "alice");
        assert_eq!(back.seq, 7);
        assert_eq!(back.time, Some(1234));
    }
}
