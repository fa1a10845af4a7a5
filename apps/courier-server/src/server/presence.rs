use std::{fmt, sync::Arc};

use courier_core::UserId;
use uuid::Uuid;

use super::{
    metrics::record_store_fault,
    store::{presence_key, RegistryStore, StoreError},
};

/// Opaque address of one live connection. Unique per connection attempt, so
/// a stale handle never compares equal to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionHandle(Uuid);

impl ConnectionHandle {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `UserId -> ConnectionHandle`, at most one entry per user. Last register
/// wins.
#[derive(Clone)]
pub(crate) struct PresenceDirectory {
    store: Arc<dyn RegistryStore>,
}

impl PresenceDirectory {
    pub(crate) fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    pub(crate) async fn register(
        &self,
        user_id: &UserId,
        handle: ConnectionHandle,
    ) -> Result<(), StoreError> {
        self.store
            .set(&presence_key(user_id), &handle.to_string())
            .await
            .inspect_err(|error| {
                record_store_fault("presence_register");
                tracing::error!(event = "presence.register_failed", %user_id, %error);
            })?;
        tracing::debug!(event = "presence.registered", %user_id, connection_id = %handle);
        Ok(())
    }

    pub(crate) async fn lookup(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ConnectionHandle>, StoreError> {
        let value = self
            .store
            .get(&presence_key(user_id))
            .await
            .inspect_err(|error| {
                record_store_fault("presence_lookup");
                tracing::error!(event = "presence.lookup_failed", %user_id, %error);
            })?;
        let Some(value) = value else {
            return Ok(None);
        };
        let handle = ConnectionHandle::parse(&value);
        if handle.is_none() {
            tracing::warn!(
                event = "presence.unreadable_handle",
                %user_id,
                "presence entry is not a connection handle; treating user as offline"
            );
        }
        Ok(handle)
    }

    /// Remove the entry only while it still points at `handle`. A newer
    /// registration for the same user is left alone.
    pub(crate) async fn deregister(
        &self,
        user_id: &UserId,
        handle: ConnectionHandle,
    ) -> Result<bool, StoreError> {
        let removed = self
            .store
            .delete_if_equals(&presence_key(user_id), &handle.to_string())
            .await
            .inspect_err(|error| {
                record_store_fault("presence_deregister");
                tracing::error!(event = "presence.deregister_failed", %user_id, %error);
            })?;
        if removed {
            tracing::debug!(event = "presence.deregistered", %user_id, connection_id = %handle);
        } else {
            tracing::debug!(
                event = "presence.deregister_stale",
                %user_id,
                connection_id = %handle,
                "presence entry already replaced or removed"
            );
        }
        Ok(removed)
    }
}
