//! Bus payload → `TelemetryPoint`s.
//!
//! Decoding runs strict JSON first, then field recovery, then device-id-only
//! recovery; a payload none of them can read is dropped.

pub mod recover;
pub mod shapes;

use std::borrow::Cow;

use ledger_client::domain::TelemetryPoint;
use serde_json::Value;
use time::{macros::format_description, Date, OffsetDateTime, Time, UtcOffset};

use crate::pipeline::{DecodeTier, Envelope, PipelineError, PointBatch, RawMessage, Transform};
use recover::RecoveryPatterns;

/// Per-message inputs the shape matchers need besides the document.
pub struct MessageContext<'a> {
    pub topic: &'a str,
    /// Local day of receipt, used for points without a timestamp.
    pub fallback_day: Date,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    #[error("empty payload")]
    Empty,
    #[error("JSON document matches no known message shape")]
    UnknownShape,
    #[error("payload is not JSON and carries no device id")]
    Unrecoverable,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub tier: DecodeTier,
    pub shape: &'static str,
    pub points: Vec<TelemetryPoint>,
}

pub struct Normalizer {
    utc_offset: UtcOffset,
    patterns: RecoveryPatterns,
}

impl Normalizer {
    pub fn new(utc_offset: UtcOffset) -> Result<Self, regex::Error> {
        Ok(Self {
            utc_offset,
            patterns: RecoveryPatterns::compile()?,
        })
    }

    pub fn normalize(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: OffsetDateTime,
    ) -> Result<Normalized, DecodeFailure> {
        let text = decode_text(payload);
        let text = text.trim_start_matches('\u{feff}').trim();
        if text.is_empty() {
            return Err(DecodeFailure::Empty);
        }

        let ctx = MessageContext {
            topic,
            fallback_day: received_at.to_offset(self.utc_offset).date(),
        };

        let (tier, doc) = match serde_json::from_str::<Value>(text) {
            Ok(doc) => (DecodeTier::Strict, doc),
            Err(e) => {
                tracing::warn!(topic, error = %e, "payload is not valid JSON, attempting field recovery");
                self.patterns.recover(text).ok_or(DecodeFailure::Unrecoverable)?
            }
        };

        let (shape, points) = shapes::extract(&doc, &ctx).ok_or(match tier {
            DecodeTier::Strict => DecodeFailure::UnknownShape,
            _ => DecodeFailure::Unrecoverable,
        })?;
        Ok(Normalized { tier, shape, points })
    }
}

/// UTF-8 when valid, otherwise each byte as its Latin-1 code point.
pub fn decode_text(payload: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(payload) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(payload.iter().map(|&b| char::from(b)).collect()),
    }
}

/// Day of a reading timestamp: `YYYY-MM-DD`, optionally followed by a
/// `HH:MM:SS` time separated by a space or `T`, with optional fraction.
pub fn parse_timestamp(raw: &str) -> Option<Date> {
    let raw = raw.trim();
    let (day, clock) = match raw.split_once([' ', 'T']) {
        Some((day, clock)) => (day, Some(clock)),
        None => (raw, None),
    };

    let day = Date::parse(day, format_description!("[year]-[month]-[day]")).ok()?;
    if let Some(clock) = clock {
        let whole = clock.split_once('.').map_or(clock, |(whole, _)| whole);
        Time::parse(whole, format_description!("[hour]:[minute]:[second]")).ok()?;
    }
    Some(day)
}

#[async_trait::async_trait]
impl Transform<RawMessage, PointBatch> for Normalizer {
    async fn apply(&self, input: Envelope<RawMessage>) -> Result<Envelope<PointBatch>, PipelineError> {
        metrics::counter!("bus_messages_received_total").increment(1);

        let message_id = input.payload.id();
        let received_at = OffsetDateTime::from(input.received_at);
        match self.normalize(&input.payload.topic, &input.payload.payload, received_at) {
            Ok(Normalized { tier, shape, points }) => {
                metrics::counter!("bus_messages_decoded_total", "tier" => tier.as_str()).increment(1);
                if tier != DecodeTier::Strict {
                    tracing::warn!(%message_id, %tier, points = points.len(), "recovered malformed payload");
                }
                tracing::debug!(%message_id, shape, points = points.len(), "normalized message");
                Ok(input.map(|raw| PointBatch {
                    message_id,
                    topic: raw.topic,
                    tier,
                    points,
                }))
            }
            Err(e) => {
                metrics::counter!("bus_messages_dropped_total").increment(1);
                Err(PipelineError::Transform(format!(
                    "dropping message {message_id} on {}: {e}",
                    input.payload.topic
                )))
            }
        }
    }
}
