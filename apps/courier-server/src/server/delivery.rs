//! Live-or-queue routing and reconnect drains.
//!
//! Delivery is at-least-once across reconnects: a drained batch is removed
//! from its queue only after every entry reached the connection's outbound
//! channel, so clients dedupe by `message_id`.

use std::sync::Arc;

use courier_core::{Message, MessageId, StatusEvent, UserId};
use courier_protocol::{CHAT_MESSAGE_EVENT, MESSAGE_STATUS_EVENT};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;

use super::{
    gateway_events,
    hub::{ConnectionHub, LinkFailure, Outgoing},
    metrics::{record_gateway_event_dropped, record_gateway_event_emitted, record_offline_drained},
    offline_queue::{OfflineQueue, QueuedEntry},
    presence::{ConnectionHandle, PresenceDirectory},
    store::{QueueKind, RegistryStore, StoreError},
};

/// Anything routed to a single recipient and parked while they are offline.
pub(crate) trait Deliverable: Serialize + DeserializeOwned + Send + Sync {
    const KIND: QueueKind;
    const EVENT_TYPE: &'static str;

    fn recipient(&self) -> &UserId;
    fn message_id(&self) -> &MessageId;
}

impl Deliverable for Message {
    const KIND: QueueKind = QueueKind::Messages;
    const EVENT_TYPE: &'static str = CHAT_MESSAGE_EVENT;

    fn recipient(&self) -> &UserId {
        &self.receiver_id
    }

    fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

impl Deliverable for StatusEvent {
    const KIND: QueueKind = QueueKind::Statuses;
    const EVENT_TYPE: &'static str = MESSAGE_STATUS_EVENT;

    fn recipient(&self) -> &UserId {
        &self.receiver_id
    }

    fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DeliveryFault {
    #[error("recipient connection is not keeping up")]
    SlowConsumer,
    #[error("recipient connection closed")]
    ConnectionClosed,
    #[error("recipient connection is not held by this process")]
    UnknownConnection,
    #[error(transparent)]
    Registry(#[from] StoreError),
}

impl DeliveryFault {
    pub(crate) const fn reason(&self) -> &'static str {
        match self {
            Self::SlowConsumer => "slow_consumer",
            Self::ConnectionClosed => "connection_closed",
            Self::UnknownConnection => "unknown_connection",
            Self::Registry(_) => "registry_unavailable",
        }
    }

    /// Text for the `error` event sent back to whoever caused the delivery.
    pub(crate) const fn client_message(&self) -> &'static str {
        match self {
            Self::SlowConsumer | Self::ConnectionClosed | Self::UnknownConnection => {
                "Recipient connection unavailable"
            }
            Self::Registry(_) => "Internal Server Error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    Live,
    Queued,
}

#[derive(Clone)]
pub(crate) struct DeliveryPipeline {
    presence: PresenceDirectory,
    queue: OfflineQueue,
    hub: ConnectionHub,
}

impl DeliveryPipeline {
    pub(crate) fn new(store: Arc<dyn RegistryStore>, hub: ConnectionHub) -> Self {
        Self {
            presence: PresenceDirectory::new(Arc::clone(&store)),
            queue: OfflineQueue::new(store),
            hub,
        }
    }

    pub(crate) fn presence(&self) -> &PresenceDirectory {
        &self.presence
    }

    pub(crate) fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub(crate) fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    /// Deliver `item` live if its recipient holds a connection here,
    /// otherwise park it in the recipient's offline queue.
    pub(crate) async fn route<T: Deliverable>(&self, item: &T) -> Result<RouteOutcome, DeliveryFault> {
        let recipient = item.recipient();

        if let Some(handle) = self.presence.lookup(recipient).await? {
            let outgoing = Outgoing {
                event: gateway_events::deliverable(item),
                entry: QueuedEntry::of(item)?,
            };
            match self.hub.send(handle, outgoing).await {
                Ok(()) => {
                    tracing::debug!(
                        event = "delivery.live",
                        kind = T::KIND.as_str(),
                        user_id = %recipient,
                        message_id = %item.message_id(),
                        connection_id = %handle
                    );
                    return Ok(RouteOutcome::Live);
                }
                Err(LinkFailure {
                    fault: DeliveryFault::UnknownConnection,
                    ..
                }) => {
                    tracing::warn!(
                        event = "delivery.stale_presence",
                        user_id = %recipient,
                        connection_id = %handle,
                        "presence points at a connection this process does not hold"
                    );
                    self.presence.deregister(recipient, handle).await?;
                }
                Err(LinkFailure { fault, stranded }) => {
                    tracing::warn!(
                        event = "delivery.live_failed",
                        kind = T::KIND.as_str(),
                        user_id = %recipient,
                        message_id = %item.message_id(),
                        connection_id = %handle,
                        reason = fault.reason()
                    );
                    self.restore_stranded(handle, stranded).await;
                    return Err(fault);
                }
            }
        }

        self.queue.append(item).await?;
        self.nudge_if_connected(recipient).await;
        Ok(RouteOutcome::Queued)
    }

    /// Release the traffic held for `handle` while its backlog drained.
    /// Anything the connection could not take goes back to the offline queue.
    pub(crate) async fn go_live(&self, handle: ConnectionHandle) -> Result<usize, DeliveryFault> {
        match self.hub.go_live(handle).await {
            Ok(released) => Ok(released),
            Err(LinkFailure { fault, stranded }) => {
                self.restore_stranded(handle, stranded).await;
                Err(fault)
            }
        }
    }

    /// Stop routing to `handle`, queueing whatever was still held for it.
    pub(crate) async fn detach(&self, handle: ConnectionHandle) {
        if let Some(stranded) = self.hub.detach(handle).await {
            self.restore_stranded(handle, stranded).await;
        }
    }

    async fn restore_stranded(&self, handle: ConnectionHandle, stranded: Vec<QueuedEntry>) {
        if stranded.is_empty() {
            return;
        }
        let mut restored = 0_usize;
        for entry in &stranded {
            if self.queue.restore(entry).await.is_ok() {
                restored += 1;
            }
        }
        tracing::warn!(
            event = "delivery.held_requeued",
            connection_id = %handle,
            restored,
            lost = stranded.len() - restored,
            "connection went away before held traffic was released"
        );
        if let Some(entry) = stranded.first() {
            self.nudge_if_connected(&entry.recipient).await;
        }
    }

    /// A recipient may have registered between the presence read and the
    /// append; make its connection drain again so the entry is not stranded.
    async fn nudge_if_connected(&self, recipient: &UserId) {
        match self.presence.lookup(recipient).await {
            Ok(Some(handle)) => {
                if self.hub.request_drain(handle).await {
                    tracing::debug!(
                        event = "delivery.drain_nudged",
                        user_id = %recipient,
                        connection_id = %handle
                    );
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(
                    event = "delivery.recheck_failed",
                    user_id = %recipient,
                    %error,
                    "entry stays queued until the next connect"
                );
            }
        }
    }

    /// Emit the recipient's `T` backlog in FIFO order, then remove exactly
    /// that batch. Nothing is removed if any emit fails, and nothing is
    /// removed if an overlapping drain already acknowledged the batch.
    pub(crate) async fn drain<T: Deliverable>(
        &self,
        user_id: &UserId,
        outbound: &mpsc::Sender<String>,
    ) -> Result<usize, DeliveryFault> {
        let batch = self.queue.peek::<T>(user_id).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        for item in &batch.entries {
            let event = gateway_events::deliverable(item);
            if outbound.send(event.payload).await.is_err() {
                record_gateway_event_dropped("user", event.event_type, "closed");
                tracing::warn!(
                    event = "offline.drain_aborted",
                    kind = T::KIND.as_str(),
                    %user_id,
                    message_id = %item.message_id(),
                    pending = batch.stored_len(),
                    "connection closed mid-drain; batch left queued"
                );
                return Err(DeliveryFault::ConnectionClosed);
            }
            record_gateway_event_emitted("user", event.event_type);
        }

        self.queue.acknowledge(user_id, &batch).await?;
        let delivered = batch.entries.len();
        record_offline_drained(T::KIND.as_str(), delivered);
        tracing::info!(
            event = "offline.drained",
            kind = T::KIND.as_str(),
            %user_id,
            delivered
        );
        Ok(delivered)
    }
}
