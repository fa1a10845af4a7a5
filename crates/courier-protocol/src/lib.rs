#![forbid(unsafe_code)]

mod events;

use serde::{Deserialize, Serialize};

pub use events::{
    event_manifest, parse_event_manifest, EventDirection, EventLifecycle, EventManifest,
    EventManifestEntry, EventManifestError, EventScope,
};

/// Wire version carried in every envelope's `v`.
pub const PROTOCOL_VERSION: u16 = 1;
/// Upper bound on one encoded frame, inbound or outbound.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;
const MAX_EVENT_TYPE_CHARS: usize = 64;

/// Client → server and server → client direct message.
pub const CHAT_MESSAGE_EVENT: &str = "chat_message";
/// Client → server and server → client delivery/read acknowledgement.
pub const MESSAGE_STATUS_EVENT: &str = "message_status";
/// Server → client non-fatal fault report.
pub const ERROR_EVENT: &str = "error";
/// Server → client handshake completion, sent after the offline backlog.
pub const READY_EVENT: &str = "ready";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame of {actual} bytes exceeds the {max} byte limit")]
    OversizedPayload { max: usize, actual: usize },
    #[error("envelope version {actual} is not supported (expected {expected})")]
    UnsupportedVersion { expected: u16, actual: u16 },
    #[error("event type must be 1-64 chars of [a-z0-9_.]")]
    InvalidEventType,
    #[error("frame is not a valid envelope")]
    InvalidJson,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}

/// `{ v, t, d }`: version, event type, event payload. Extra keys are refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    pub v: u16,
    pub t: EventType,
    pub d: T,
}

impl<T> Envelope<T> {
    /// # Errors
    /// Returns [`ProtocolError::InvalidEventType`] for a malformed event type.
    pub fn new(event_type: &str, data: T) -> Result<Self, ProtocolError> {
        let t = EventType::try_from(event_type.to_owned())?;
        Ok(Self {
            v: PROTOCOL_VERSION,
            t,
            d: data,
        })
    }
}

/// Lower-case event name, checked on construction and on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventType {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_event_type(&value).map(|()| Self(value))
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// Decode one inbound frame. Size is checked before any JSON work.
///
/// # Errors
/// Returns [`ProtocolError`] for an oversized frame, invalid JSON, unknown
/// keys, a malformed event type, or a version other than [`PROTOCOL_VERSION`].
pub fn parse_envelope(frame: &[u8]) -> Result<Envelope<serde_json::Value>, ProtocolError> {
    if frame.len() > MAX_EVENT_BYTES {
        return Err(ProtocolError::OversizedPayload {
            max: MAX_EVENT_BYTES,
            actual: frame.len(),
        });
    }

    let envelope = serde_json::from_slice::<Envelope<serde_json::Value>>(frame)?;
    match envelope.v {
        PROTOCOL_VERSION => Ok(envelope),
        actual => Err(ProtocolError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            actual,
        }),
    }
}

/// Encode an outbound event as envelope text.
///
/// # Errors
/// Returns [`ProtocolError`] if the event type is malformed or `data` does
/// not serialize.
pub fn encode_event<T: Serialize>(event_type: &str, data: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(&Envelope::new(event_type, data)?)?;
    Ok(text)
}

pub(crate) fn validate_event_type(value: &str) -> Result<(), ProtocolError> {
    let well_formed = (1..=MAX_EVENT_TYPE_CHARS).contains(&value.len())
        && value
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.'));
    if well_formed {
        Ok(())
    } else {
        Err(ProtocolError::InvalidEventType)
    }
}
