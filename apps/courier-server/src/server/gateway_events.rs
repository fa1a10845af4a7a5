use courier_core::{MessageId, UserId};
use courier_protocol::{encode_event, ERROR_EVENT, READY_EVENT};
use serde::Serialize;

use super::{delivery::Deliverable, metrics::record_gateway_event_dropped, presence::ConnectionHandle};

const SERIALIZE_ERROR_FALLBACK: &str =
    r#"{"v":1,"t":"error","d":{"message":"event could not be encoded"}}"#;

pub(crate) struct GatewayEvent {
    pub(crate) event_type: &'static str,
    pub(crate) payload: String,
}

fn build_event<T: Serialize>(event_type: &'static str, payload: &T) -> GatewayEvent {
    let payload = encode_event(event_type, payload).unwrap_or_else(|error| {
        record_gateway_event_dropped("connection", event_type, "serialize_error");
        tracing::error!(event = "gateway.event.encode_failed", event_type, %error);
        String::from(SERIALIZE_ERROR_FALLBACK)
    });
    GatewayEvent {
        event_type,
        payload,
    }
}

#[derive(Serialize)]
struct ReadyPayload<'a> {
    user_id: &'a UserId,
    connection_id: String,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<&'a MessageId>,
}

/// Handshake completion; sent once the offline backlog has been flushed.
pub(crate) fn ready(user_id: &UserId, handle: ConnectionHandle) -> GatewayEvent {
    build_event(
        READY_EVENT,
        &ReadyPayload {
            user_id,
            connection_id: handle.to_string(),
        },
    )
}

pub(crate) fn error(message: &str, message_id: Option<&MessageId>) -> GatewayEvent {
    build_event(
        ERROR_EVENT,
        &ErrorPayload {
            message,
            message_id,
        },
    )
}

/// `chat_message` for a [`courier_core::Message`], `message_status` for a
/// [`courier_core::StatusEvent`].
pub(crate) fn deliverable<T: Deliverable>(item: &T) -> GatewayEvent {
    build_event(T::EVENT_TYPE, item)
}
