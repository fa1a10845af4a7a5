use std::sync::Arc;

use courier_core::UserId;

use super::{
    delivery::Deliverable,
    metrics::{record_offline_append, record_store_fault},
    store::{QueueKind, RegistryStore, StoreError},
};

/// One read of a recipient's queue. `stored` keeps every raw entry that was
/// read, including unreadable ones, so acknowledging the batch removes
/// exactly what was looked at and nothing a concurrent reader left behind.
#[derive(Debug)]
pub(crate) struct QueuedBatch<T> {
    pub(crate) entries: Vec<T>,
    stored: Vec<String>,
}

impl<T> QueuedBatch<T> {
    pub(crate) fn stored_len(&self) -> usize {
        self.stored.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.stored.is_empty()
    }
}

/// An item in the form it is stored in its recipient's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedEntry {
    pub(crate) kind: QueueKind,
    pub(crate) recipient: UserId,
    pub(crate) stored: String,
}

impl QueuedEntry {
    pub(crate) fn of<T: Deliverable>(item: &T) -> Result<Self, StoreError> {
        let stored = serde_json::to_string(item)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        Ok(Self {
            kind: T::KIND,
            recipient: item.recipient().clone(),
            stored,
        })
    }
}

/// Per-recipient FIFO backlogs of messages and statuses.
#[derive(Clone)]
pub(crate) struct OfflineQueue {
    store: Arc<dyn RegistryStore>,
}

impl OfflineQueue {
    pub(crate) fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    pub(crate) async fn append<T: Deliverable>(&self, item: &T) -> Result<usize, StoreError> {
        let depth = self.push(&QueuedEntry::of(item)?).await?;
        tracing::info!(
            event = "offline.enqueued",
            kind = T::KIND.as_str(),
            user_id = %item.recipient(),
            message_id = %item.message_id(),
            depth
        );
        Ok(depth)
    }

    /// Park an entry again after the connection it was handed to went away
    /// before emitting it.
    pub(crate) async fn restore(&self, entry: &QueuedEntry) -> Result<usize, StoreError> {
        let depth = self.push(entry).await?;
        tracing::info!(
            event = "offline.restored",
            kind = entry.kind.as_str(),
            user_id = %entry.recipient,
            depth
        );
        Ok(depth)
    }

    async fn push(&self, entry: &QueuedEntry) -> Result<usize, StoreError> {
        let depth = self
            .store
            .list_push(&entry.kind.key(&entry.recipient), &entry.stored)
            .await
            .inspect_err(|error| {
                record_store_fault("queue_append");
                tracing::error!(
                    event = "offline.append_failed",
                    kind = entry.kind.as_str(),
                    user_id = %entry.recipient,
                    %error
                );
            })?;
        record_offline_append(entry.kind.as_str());
        Ok(depth)
    }

    /// Read the recipient's backlog without removing it.
    pub(crate) async fn peek<T: Deliverable>(
        &self,
        recipient: &UserId,
    ) -> Result<QueuedBatch<T>, StoreError> {
        let stored = self
            .store
            .list_range(&T::KIND.key(recipient))
            .await
            .inspect_err(|error| {
                record_store_fault("queue_read");
                tracing::error!(
                    event = "offline.read_failed",
                    kind = T::KIND.as_str(),
                    user_id = %recipient,
                    %error
                );
            })?;
        let entries = stored
            .iter()
            .filter_map(|raw| match serde_json::from_str::<T>(raw) {
                Ok(entry) => Some(entry),
                Err(error) => {
                    tracing::warn!(
                        event = "offline.unreadable_entry",
                        kind = T::KIND.as_str(),
                        user_id = %recipient,
                        %error,
                        "skipping queued entry that no longer validates"
                    );
                    None
                }
            })
            .collect();
        Ok(QueuedBatch { entries, stored })
    }

    /// Drop a batch previously returned by [`Self::peek`], provided it is
    /// still the head of the queue. Returns `false` when another drain
    /// already removed it.
    pub(crate) async fn acknowledge<T: Deliverable>(
        &self,
        recipient: &UserId,
        batch: &QueuedBatch<T>,
    ) -> Result<bool, StoreError> {
        let dropped = self
            .store
            .list_drop_prefix(&T::KIND.key(recipient), &batch.stored)
            .await
            .inspect_err(|error| {
                record_store_fault("queue_trim");
                tracing::error!(
                    event = "offline.trim_failed",
                    kind = T::KIND.as_str(),
                    user_id = %recipient,
                    %error
                );
            })?;
        if !dropped {
            tracing::info!(
                event = "offline.ack_skipped",
                kind = T::KIND.as_str(),
                user_id = %recipient,
                batch = batch.stored_len(),
                "queue head moved since the batch was read"
            );
        }
        Ok(dropped)
    }
}
