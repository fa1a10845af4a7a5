#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Maximum UTF-8 bytes of a `text` message body.
pub const MAX_TEXT_CONTENT_BYTES: usize = 4_000;
/// Maximum UTF-8 bytes of a media reference (URL or object key).
pub const MAX_MEDIA_REFERENCE_BYTES: usize = 2_048;
/// Maximum serialized size of the optional metadata object.
pub const MAX_METADATA_BYTES: usize = 4_096;
const MAX_IDENTIFIER_CHARS: usize = 128;
const NULL_LIKE_IDENTIFIERS: [&str; 4] = ["0", "null", "undefined", "nil"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("message id is invalid")]
    InvalidMessageId,
    #[error("message content is invalid")]
    InvalidContent,
    #[error("message timestamp is invalid")]
    InvalidTimestamp,
    #[error("message metadata is invalid")]
    InvalidMetadata,
    #[error("sender does not match the authenticated principal")]
    SenderMismatch,
}

/// Identity of a user as issued by the credential service.
///
/// Null-like sentinels (`""`, `"0"`, `"null"`, `"undefined"`, `"nil"`) never
/// parse, so no token, presence entry, or queue key can exist for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !is_valid_identifier(&value)
            || NULL_LIKE_IDENTIFIERS
                .iter()
                .any(|sentinel| value.eq_ignore_ascii_case(sentinel))
        {
            return Err(DomainError::InvalidUserId);
        }
        Ok(Self(value))
    }
}

impl TryFrom<&str> for UserId {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique message identifier, client-supplied or a server ULID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !is_valid_identifier(&value) {
            return Err(DomainError::InvalidMessageId);
        }
        Ok(Self(value))
    }
}

impl TryFrom<&str> for MessageId {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Image,
    File,
    Video,
    Audio,
}

impl ContentType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    /// Media kinds carry a reference to the blob, never the blob itself.
    #[must_use]
    pub const fn max_content_bytes(self) -> usize {
        match self {
            Self::Text => MAX_TEXT_CONTENT_BYTES,
            Self::Image | Self::File | Self::Video | Self::Audio => MAX_MEDIA_REFERENCE_BYTES,
        }
    }
}

/// Per-message status as seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Seen,
    Failed,
}

impl MessageStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Seen => "seen",
            Self::Failed => "failed",
        }
    }
}

/// The only statuses that travel as acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Delivered,
    Seen,
}

impl AckStatus {
    #[must_use]
    pub const fn as_message_status(self) -> MessageStatus {
        match self {
            Self::Delivered => MessageStatus::Delivered,
            Self::Seen => MessageStatus::Seen,
        }
    }
}

impl From<AckStatus> for MessageStatus {
    fn from(value: AckStatus) -> Self {
        value.as_message_status()
    }
}

pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A validated direct message. Immutable once routed, apart from `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub content_type: ContentType,
    pub timestamp: String,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// A message exactly as a client submitted it, before any validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageDraft {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    pub receiver_id: String,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl MessageDraft {
    /// Validate the draft and bind it to the authenticated sender.
    ///
    /// Missing ids and timestamps are filled in; `status` always starts at
    /// [`MessageStatus::Sent`] whatever the client claimed.
    ///
    /// # Errors
    /// Returns [`DomainError`] when any field fails validation or when a
    /// supplied `sender_id` names someone other than `sender`.
    pub fn into_message(self, sender: &UserId, now: DateTime<Utc>) -> Result<Message, DomainError> {
        if let Some(claimed) = self.sender_id.as_deref() {
            if !claimed.is_empty() && claimed != sender.as_str() {
                return Err(DomainError::SenderMismatch);
            }
        }
        let message_id = match self.message_id {
            Some(value) => MessageId::try_from(value)?,
            None => MessageId::generate(),
        };
        let receiver_id = UserId::try_from(self.receiver_id)?;
        validate_content(&self.content, self.content_type)?;
        let timestamp = match self.timestamp {
            Some(value) => {
                validate_timestamp(&value)?;
                value
            }
            None => now.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        if let Some(metadata) = &self.metadata {
            validate_metadata(metadata)?;
        }

        Ok(Message {
            message_id,
            sender_id: sender.clone(),
            receiver_id,
            content: self.content,
            content_type: self.content_type,
            timestamp,
            status: MessageStatus::Sent,
            metadata: self.metadata,
        })
    }
}

/// Delivery or read acknowledgement for a previously sent message.
///
/// `receiver_id` is whoever needs to learn the new status, i.e. the
/// original sender of `message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusEvent {
    pub message_id: MessageId,
    pub receiver_id: UserId,
    pub status: AckStatus,
}

fn is_valid_identifier(value: &str) -> bool {
    (1..=MAX_IDENTIFIER_CHARS).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn validate_content(content: &str, content_type: ContentType) -> Result<(), DomainError> {
    if content.trim().is_empty() || content.len() > content_type.max_content_bytes() {
        return Err(DomainError::InvalidContent);
    }
    if content.contains('\0') {
        return Err(DomainError::InvalidContent);
    }
    Ok(())
}

fn validate_timestamp(value: &str) -> Result<(), DomainError> {
    DateTime::parse_from_rfc3339(value)
        .map(|_| ())
        .map_err(|_| DomainError::InvalidTimestamp)
}

fn validate_metadata(metadata: &Metadata) -> Result<(), DomainError> {
    let encoded = serde_json::to_string(metadata).map_err(|_| DomainError::InvalidMetadata)?;
    if encoded.len() > MAX_METADATA_BYTES {
        return Err(DomainError::InvalidMetadata);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{
        AckStatus, ContentType, DomainError, Message, MessageDraft, MessageId,
        MessageStatus, StatusEvent, UserId, MAX_TEXT_CONTENT_BYTES,
    };

    fn draft(value: serde_json::Value) -> MessageDraft {
        serde_json::from_value(value).expect("draft should deserialize")
    }

    fn alice() -> UserId {
        UserId::try_from("alice").unwrap()
    }

    #[test]
    fn user_id_rejects_empty_and_null_like_sentinels() {
        for value in ["", "0", "null", "NULL", "undefined", "nil"] {
            assert_eq!(
                UserId::try_from(value).unwrap_err(),
                DomainError::InvalidUserId,
                "{value:?} must not parse"
            );
        }
        assert_eq!(
            UserId::try_from("a b").unwrap_err(),
            DomainError::InvalidUserId
        );
        assert_eq!(
            UserId::try_from("x".repeat(129)).unwrap_err(),
            DomainError::InvalidUserId
        );
        assert_eq!(UserId::try_from("42").unwrap().as_str(), "42");
    }

    #[test]
    fn user_id_deserialization_goes_through_validation() {
        let parsed: Result<UserId, _> = serde_json::from_value(json!("null"));
        assert!(parsed.is_err());
        let parsed: UserId = serde_json::from_value(json!("user-7")).unwrap();
        assert_eq!(parsed.as_str(), "user-7");
    }

    #[test]
    fn draft_is_bound_to_sender_and_forced_to_sent() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let message = draft(json!({
            "message_id": "m1",
            "receiver_id": "bob",
            "content": "hi",
            "content_type": "text",
            "status": "seen"
        }))
        .into_message(&alice(), now)
        .unwrap();

        assert_eq!(message.message_id.as_str(), "m1");
        assert_eq!(message.sender_id, alice());
        assert_eq!(message.receiver_id.as_str(), "bob");
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.timestamp, "2024-05-01T12:00:00.000Z");
    }

    #[test]
    fn draft_generates_message_id_and_keeps_client_timestamp() {
        let message = draft(json!({
            "receiver_id": "bob",
            "content": "https://cdn.example.com/a.png",
            "content_type": "image",
            "timestamp": "2024-05-01T11:59:59.123Z",
            "metadata": {"width": 640}
        }))
        .into_message(&alice(), Utc::now())
        .unwrap();

        assert!(!message.message_id.as_str().is_empty());
        assert_eq!(message.timestamp, "2024-05-01T11:59:59.123Z");
        assert_eq!(message.metadata.unwrap()["width"], json!(640));
    }

    #[test]
    fn draft_rejects_spoofed_sender() {
        let error = draft(json!({
            "sender_id": "mallory",
            "receiver_id": "bob",
            "content": "hi",
            "content_type": "text"
        }))
        .into_message(&alice(), Utc::now())
        .unwrap_err();
        assert_eq!(error, DomainError::SenderMismatch);
    }

    #[test]
    fn draft_rejects_invalid_fields() {
        let cases = [
            (
                json!({"receiver_id": "undefined", "content": "hi", "content_type": "text"}),
                DomainError::InvalidUserId,
            ),
            (
                json!({"receiver_id": "bob", "content": "   ", "content_type": "text"}),
                DomainError::InvalidContent,
            ),
            (
                json!({"receiver_id": "bob", "content": "x".repeat(MAX_TEXT_CONTENT_BYTES + 1), "content_type": "text"}),
                DomainError::InvalidContent,
            ),
            (
                json!({"receiver_id": "bob", "content": "hi", "content_type": "text", "timestamp": "yesterday"}),
                DomainError::InvalidTimestamp,
            ),
            (
                json!({"message_id": "", "receiver_id": "bob", "content": "hi", "content_type": "text"}),
                DomainError::InvalidMessageId,
            ),
        ];
        for (value, expected) in cases {
            let error = draft(value).into_message(&alice(), Utc::now()).unwrap_err();
            assert_eq!(error, expected);
        }
    }

    #[test]
    fn draft_schema_rejects_unknown_fields_and_content_types() {
        let unknown_field = serde_json::from_value::<MessageDraft>(json!({
            "receiver_id": "bob", "content": "hi", "content_type": "text", "admin": true
        }));
        assert!(unknown_field.is_err());

        let unknown_kind = serde_json::from_value::<MessageDraft>(json!({
            "receiver_id": "bob", "content": "hi", "content_type": "sticker"
        }));
        assert!(unknown_kind.is_err());

        let metadata_not_object = serde_json::from_value::<MessageDraft>(json!({
            "receiver_id": "bob", "content": "hi", "content_type": "text", "metadata": [1, 2]
        }));
        assert!(metadata_not_object.is_err());
    }

    #[test]
    fn status_event_never_carries_sent_or_failed() {
        for status in ["sent", "failed"] {
            let parsed = serde_json::from_value::<StatusEvent>(json!({
                "message_id": "m1", "receiver_id": "alice", "status": status
            }));
            assert!(parsed.is_err(), "{status} must be rejected");
        }
        let parsed: StatusEvent = serde_json::from_value(json!({
            "message_id": "m1", "receiver_id": "alice", "status": "delivered"
        }))
        .unwrap();
        assert_eq!(parsed.status, AckStatus::Delivered);
    }

    #[test]
    fn message_serializes_with_wire_field_names() {
        let message = Message {
            message_id: MessageId::try_from("m1").unwrap(),
            sender_id: alice(),
            receiver_id: UserId::try_from("bob").unwrap(),
            content: String::from("hi"),
            content_type: ContentType::Text,
            timestamp: String::from("2024-05-01T12:00:00.000Z"),
            status: MessageStatus::Sent,
            metadata: None,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["content_type"], json!("text"));
        assert_eq!(value["status"], json!("sent"));
        assert!(value.get("metadata").is_none());
    }
}
