//! Connections held by this process, addressed by [`ConnectionHandle`].

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, watch, Notify, RwLock};

use super::{
    delivery::DeliveryFault,
    gateway_events::GatewayEvent,
    metrics::{record_gateway_event_dropped, record_gateway_event_emitted},
    offline_queue::QueuedEntry,
    presence::ConnectionHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionControl {
    Open,
    Close,
}

/// A routed item: the frame for a live connection and the queue form to
/// fall back on.
pub(crate) struct Outgoing {
    pub(crate) event: GatewayEvent,
    pub(crate) entry: QueuedEntry,
}

/// Failure to hand traffic to a connection. `stranded` lists items that were
/// accepted while the connection was held back and never reached it; they
/// belong in the offline queue.
#[derive(Debug)]
pub(crate) struct LinkFailure {
    pub(crate) fault: DeliveryFault,
    pub(crate) stranded: Vec<QueuedEntry>,
}

impl From<DeliveryFault> for LinkFailure {
    fn from(fault: DeliveryFault) -> Self {
        Self {
            fault,
            stranded: Vec::new(),
        }
    }
}

/// Until its backlog is flushed a connection holds live traffic back, so
/// queued entries always reach the client first.
enum LinkPhase {
    Backlog(Vec<Outgoing>),
    Live,
}

struct ConnectionLink {
    outbound: mpsc::Sender<String>,
    control: watch::Sender<ConnectionControl>,
    drain: Arc<Notify>,
    phase: LinkPhase,
}

impl ConnectionLink {
    fn take_held(&mut self) -> Vec<QueuedEntry> {
        match std::mem::replace(&mut self.phase, LinkPhase::Live) {
            LinkPhase::Backlog(held) => held.into_iter().map(|item| item.entry).collect(),
            LinkPhase::Live => Vec::new(),
        }
    }
}

/// Channels the connection task owns the other ends of.
pub(crate) struct LinkChannels {
    pub(crate) outbound: mpsc::Sender<String>,
    pub(crate) control: watch::Sender<ConnectionControl>,
    pub(crate) drain: Arc<Notify>,
}

#[derive(Clone, Default)]
pub(crate) struct ConnectionHub {
    links: Arc<RwLock<HashMap<ConnectionHandle, ConnectionLink>>>,
}

impl ConnectionHub {
    pub(crate) async fn attach(&self, handle: ConnectionHandle, channels: LinkChannels) {
        self.links.write().await.insert(
            handle,
            ConnectionLink {
                outbound: channels.outbound,
                control: channels.control,
                drain: channels.drain,
                phase: LinkPhase::Backlog(Vec::new()),
            },
        );
    }

    /// Forget the connection. Anything still held for it is returned so the
    /// caller can queue it.
    pub(crate) async fn detach(&self, handle: ConnectionHandle) -> Option<Vec<QueuedEntry>> {
        let mut link = self.links.write().await.remove(&handle)?;
        Some(link.take_held())
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, handle: ConnectionHandle) -> bool {
        self.links.read().await.contains_key(&handle)
    }

    /// Hand `outgoing` to the connection without waiting. A full queue marks
    /// the connection as a slow consumer and closes it.
    pub(crate) async fn send(
        &self,
        handle: ConnectionHandle,
        outgoing: Outgoing,
    ) -> Result<(), LinkFailure> {
        let mut links = self.links.write().await;
        let Some(link) = links.get_mut(&handle) else {
            return Err(DeliveryFault::UnknownConnection.into());
        };
        match dispatch_to_link(link, outgoing) {
            Ok(()) => Ok(()),
            Err(fault) => {
                let stranded = link.take_held();
                links.remove(&handle);
                Err(LinkFailure { fault, stranded })
            }
        }
    }

    /// Release held live traffic behind the flushed backlog. On failure the
    /// held items that did not make it out are handed back as stranded.
    pub(crate) async fn go_live(&self, handle: ConnectionHandle) -> Result<usize, LinkFailure> {
        let mut links = self.links.write().await;
        let Some(link) = links.get_mut(&handle) else {
            return Err(DeliveryFault::UnknownConnection.into());
        };
        let held = match std::mem::replace(&mut link.phase, LinkPhase::Live) {
            LinkPhase::Backlog(held) => held,
            LinkPhase::Live => return Ok(0),
        };
        let released = held.len();
        let mut held = held.into_iter();
        while let Some(item) = held.next() {
            if let Err(fault) = try_enqueue(link, item.event.payload, "held") {
                let stranded = std::iter::once(item.entry)
                    .chain(held.map(|rest| rest.entry))
                    .collect();
                links.remove(&handle);
                return Err(LinkFailure { fault, stranded });
            }
        }
        Ok(released)
    }

    /// Ask the connection to re-read its offline queues.
    pub(crate) async fn request_drain(&self, handle: ConnectionHandle) -> bool {
        let links = self.links.read().await;
        let Some(link) = links.get(&handle) else {
            return false;
        };
        link.drain.notify_one();
        true
    }
}

fn dispatch_to_link(link: &mut ConnectionLink, outgoing: Outgoing) -> Result<(), DeliveryFault> {
    let event_type = outgoing.event.event_type;
    if let LinkPhase::Backlog(held) = &mut link.phase {
        if held.len() >= link.outbound.max_capacity() {
            record_gateway_event_dropped("user", event_type, "full_queue");
            let _ = link.control.send(ConnectionControl::Close);
            return Err(DeliveryFault::SlowConsumer);
        }
        held.push(outgoing);
        record_gateway_event_emitted("user", event_type);
        return Ok(());
    }

    try_enqueue(link, outgoing.event.payload, event_type)?;
    record_gateway_event_emitted("user", event_type);
    Ok(())
}

fn try_enqueue(
    link: &ConnectionLink,
    payload: String,
    event_type: &'static str,
) -> Result<(), DeliveryFault> {
    match link.outbound.try_send(payload) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            record_gateway_event_dropped("user", event_type, "closed");
            Err(DeliveryFault::ConnectionClosed)
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            record_gateway_event_dropped("user", event_type, "full_queue");
            let _ = link.control.send(ConnectionControl::Close);
            Err(DeliveryFault::SlowConsumer)
        }
    }
}
