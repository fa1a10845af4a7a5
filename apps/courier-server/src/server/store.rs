//! Key/value port shared by the presence directory and the offline queues.
//!
//! Backends only provide string values and string lists; everything that
//! knows about users, connections, and messages lives above this seam.

use courier_core::UserId;
use futures_util::future::BoxFuture;

pub(crate) mod in_memory;
pub(crate) mod redis_store;

pub(crate) const PRESENCE_KEY_PREFIX: &str = "online";
pub(crate) const MESSAGE_QUEUE_KEY_PREFIX: &str = "offline_msgs";
pub(crate) const STATUS_QUEUE_KEY_PREFIX: &str = "offline_status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum QueueKind {
    Messages,
    Statuses,
}

impl QueueKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Statuses => "statuses",
        }
    }

    const fn key_prefix(self) -> &'static str {
        match self {
            Self::Messages => MESSAGE_QUEUE_KEY_PREFIX,
            Self::Statuses => STATUS_QUEUE_KEY_PREFIX,
        }
    }

    pub(crate) fn key(self, user_id: &UserId) -> String {
        format!("{}:{user_id}", self.key_prefix())
    }
}

pub(crate) fn presence_key(user_id: &UserId) -> String {
    format!("{PRESENCE_KEY_PREFIX}:{user_id}")
}

/// Failure of the external registry store. Surfaces to callers as a
/// delivery fault; never tears down the process.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub(crate) enum StoreError {
    #[error("registry store unavailable: {0}")]
    Unavailable(String),
    #[error("registry store command failed: {0}")]
    Command(String),
    #[error("registry store payload invalid: {0}")]
    Serialization(String),
}

pub(crate) trait RegistryStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), StoreError>>;

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>>;

    /// Delete `key` only while it still holds `expected`. Returns whether a
    /// delete happened.
    fn delete_if_equals(&self, key: &str, expected: &str)
        -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Append to the tail of the list at `key`, returning the new length.
    fn list_push(&self, key: &str, value: &str) -> BoxFuture<'_, Result<usize, StoreError>>;

    /// Snapshot of the whole list, head first.
    fn list_range(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, StoreError>>;

    /// Remove the head of the list only while it still equals `expected`,
    /// atomically. Returns whether anything was removed; a mismatch means
    /// someone else already consumed that prefix.
    fn list_drop_prefix(
        &self,
        key: &str,
        expected: &[String],
    ) -> BoxFuture<'_, Result<bool, StoreError>>;
}
