//! Per-connection controller: registration, backlog flush, inbound events,
//! and teardown for one authenticated WebSocket.

use chrono::Utc;
use courier_core::{Message, MessageDraft, MessageId, StatusEvent};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    delivery::{DeliveryFault, DeliveryPipeline},
    gateway_events::{self, GatewayEvent},
    hub::LinkChannels,
    metrics::{
        record_gateway_event_dropped, record_gateway_event_emitted,
        record_gateway_event_parse_rejected,
    },
    presence::ConnectionHandle,
    tokens::Principal,
};

pub(crate) struct ChatSession {
    delivery: DeliveryPipeline,
    principal: Principal,
    handle: ConnectionHandle,
    outbound: mpsc::Sender<String>,
}

impl ChatSession {
    /// Attach, register presence, flush both backlogs, announce `ready`, and
    /// only then release live traffic to the connection.
    pub(crate) async fn open(
        delivery: DeliveryPipeline,
        principal: Principal,
        handle: ConnectionHandle,
        channels: LinkChannels,
    ) -> Self {
        let outbound = channels.outbound.clone();
        delivery.hub().attach(handle, channels).await;
        let session = Self {
            delivery,
            principal,
            handle,
            outbound,
        };

        if let Err(error) = session
            .delivery
            .presence()
            .register(&session.principal.user_id, handle)
            .await
        {
            tracing::error!(
                event = "session.register_failed",
                user_id = %session.principal.user_id,
                connection_id = %handle,
                %error,
                "connection stays open but cannot receive live traffic"
            );
            session.emit(gateway_events::error("Internal Server Error", None));
        }

        session.drain_backlog().await;
        let ready = gateway_events::ready(&session.principal.user_id, handle);
        if session.outbound.send(ready.payload).await.is_ok() {
            record_gateway_event_emitted("connection", ready.event_type);
        } else {
            record_gateway_event_dropped("connection", ready.event_type, "closed");
        }

        match session.delivery.go_live(handle).await {
            Ok(released) if released > 0 => {
                tracing::debug!(
                    event = "session.live_released",
                    connection_id = %handle,
                    released
                );
            }
            Ok(_) => {}
            Err(fault) => {
                tracing::warn!(
                    event = "session.go_live_failed",
                    connection_id = %handle,
                    reason = fault.reason()
                );
            }
        }
        tracing::info!(
            event = "session.opened",
            user_id = %session.principal.user_id,
            connection_id = %handle
        );
        session
    }

    /// Flush queued messages, then queued statuses.
    pub(crate) async fn drain_backlog(&self) {
        let user_id = &self.principal.user_id;
        if let Err(fault) = self.delivery.drain::<Message>(user_id, &self.outbound).await {
            self.report_drain_fault(&fault);
            return;
        }
        if let Err(fault) = self
            .delivery
            .drain::<StatusEvent>(user_id, &self.outbound)
            .await
        {
            self.report_drain_fault(&fault);
        }
    }

    pub(crate) async fn on_chat_message(&self, data: Value) {
        let draft = match serde_json::from_value::<MessageDraft>(data) {
            Ok(draft) => draft,
            Err(error) => {
                record_gateway_event_parse_rejected("ingress", "invalid_chat_message_payload");
                tracing::info!(
                    event = "session.message_rejected",
                    connection_id = %self.handle,
                    %error
                );
                self.emit(gateway_events::error("Invalid chat_message payload", None));
                return;
            }
        };
        let client_message_id = draft
            .message_id
            .as_deref()
            .and_then(|id| MessageId::try_from(id).ok());

        let message = match draft.into_message(&self.principal.user_id, Utc::now()) {
            Ok(message) => message,
            Err(error) => {
                record_gateway_event_parse_rejected("ingress", "invalid_chat_message");
                tracing::info!(
                    event = "session.message_rejected",
                    user_id = %self.principal.user_id,
                    connection_id = %self.handle,
                    %error
                );
                self.emit(gateway_events::error(
                    &error.to_string(),
                    client_message_id.as_ref(),
                ));
                return;
            }
        };

        if let Err(fault) = self.delivery.route(&message).await {
            self.report_delivery_fault(&fault, &message.message_id);
        }
    }

    pub(crate) async fn on_message_status(&self, data: Value) {
        let status = match serde_json::from_value::<StatusEvent>(data) {
            Ok(status) => status,
            Err(error) => {
                record_gateway_event_parse_rejected("ingress", "invalid_message_status_payload");
                tracing::info!(
                    event = "session.status_rejected",
                    connection_id = %self.handle,
                    %error
                );
                self.emit(gateway_events::error("Invalid message_status payload", None));
                return;
            }
        };

        if let Err(fault) = self.delivery.route(&status).await {
            self.report_delivery_fault(&fault, &status.message_id);
        }
    }

    /// Reply on this connection only, without blocking the reader.
    pub(crate) fn emit(&self, event: GatewayEvent) {
        if self.outbound.try_send(event.payload).is_err() {
            record_gateway_event_dropped("connection", event.event_type, "full_queue");
            tracing::warn!(
                event = "session.reply_dropped",
                connection_id = %self.handle,
                event_type = event.event_type
            );
            return;
        }
        record_gateway_event_emitted("connection", event.event_type);
    }

    /// Stop routing to this connection, then drop its presence entry if it
    /// is still ours.
    pub(crate) async fn close(self) {
        self.delivery.detach(self.handle).await;
        if let Err(error) = self
            .delivery
            .presence()
            .deregister(&self.principal.user_id, self.handle)
            .await
        {
            tracing::error!(
                event = "session.deregister_failed",
                user_id = %self.principal.user_id,
                connection_id = %self.handle,
                %error
            );
        }
        tracing::info!(
            event = "session.closed",
            user_id = %self.principal.user_id,
            connection_id = %self.handle
        );
    }

    fn report_delivery_fault(&self, fault: &DeliveryFault, message_id: &MessageId) {
        tracing::warn!(
            event = "session.delivery_failed",
            user_id = %self.principal.user_id,
            connection_id = %self.handle,
            %message_id,
            reason = fault.reason(),
            %fault
        );
        self.emit(gateway_events::error(fault.client_message(), Some(message_id)));
    }

    fn report_drain_fault(&self, fault: &DeliveryFault) {
        tracing::warn!(
            event = "session.drain_failed",
            user_id = %self.principal.user_id,
            connection_id = %self.handle,
            reason = fault.reason(),
            %fault
        );
        if matches!(fault, DeliveryFault::Registry(_)) {
            self.emit(gateway_events::error("Internal Server Error", None));
        }
    }
}
