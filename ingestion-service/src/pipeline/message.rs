use std::fmt;

use bytes::Bytes;
use ledger_client::domain::TelemetryPoint;

/// A message as it arrived from the bus (or a replay file).
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn id(&self) -> String {
        message_id(&self.topic, &self.payload)
    }
}

/// Short content hash used to correlate log lines of one message.
pub fn message_id(topic: &str, payload: &[u8]) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&(topic.len() as u32).to_le_bytes());
    h.update(topic.as_bytes());
    h.update(payload);
    let mut id = h.finalize().to_hex().to_string();
    id.truncate(16);
    id
}

/// Which decoding path produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeTier {
    /// The payload was valid JSON.
    Strict,
    /// Field-level pattern extraction over malformed JSON.
    Recovered,
    /// Only the device id could be found.
    Minimal,
}

impl DecodeTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Recovered => "recovered",
            Self::Minimal => "minimal",
        }
    }
}

impl fmt::Display for DecodeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized content of one inbound message.
#[derive(Debug, Clone)]
pub struct PointBatch {
    pub message_id: String,
    pub topic: String,
    pub tier: DecodeTier,
    pub points: Vec<TelemetryPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_depends_on_topic_and_payload() {
        let a = message_id("/gw/1", b"{}");
        assert_eq!(a.len(), 16);
        assert_eq!(a, message_id("/gw/1", b"{}"));
        assert_ne!(a, message_id("/gw/2", b"{}"));
        assert_ne!(a, message_id("/gw/1", b"[]"));
    }
}
