use std::collections::{HashMap, VecDeque};

use futures_util::future::BoxFuture;
use tokio::sync::RwLock;

use super::{RegistryStore, StoreError};

/// Process-local store. Default backend and the test fake.
#[derive(Default)]
pub(crate) struct InMemoryStore {
    values: RwLock<HashMap<String, String>>,
    lists: RwLock<HashMap<String, VecDeque<String>>>,
}

impl RegistryStore for InMemoryStore {
    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.to_owned();
        let value = value.to_owned();
        Box::pin(async move {
            self.values.write().await.insert(key, value);
            Ok(())
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        let key = key.to_owned();
        Box::pin(async move { Ok(self.values.read().await.get(&key).cloned()) })
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.to_owned();
        let expected = expected.to_owned();
        Box::pin(async move {
            let mut values = self.values.write().await;
            if values.get(&key).is_some_and(|current| *current == expected) {
                values.remove(&key);
                return Ok(true);
            }
            Ok(false)
        })
    }

    fn list_push(&self, key: &str, value: &str) -> BoxFuture<'_, Result<usize, StoreError>> {
        let key = key.to_owned();
        let value = value.to_owned();
        Box::pin(async move {
            let mut lists = self.lists.write().await;
            let list = lists.entry(key).or_default();
            list.push_back(value);
            Ok(list.len())
        })
    }

    fn list_range(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        let key = key.to_owned();
        Box::pin(async move {
            Ok(self
                .lists
                .read()
                .await
                .get(&key)
                .map(|list| list.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn list_drop_prefix(
        &self,
        key: &str,
        expected: &[String],
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.to_owned();
        let expected = expected.to_vec();
        Box::pin(async move {
            if expected.is_empty() {
                return Ok(true);
            }
            let mut lists = self.lists.write().await;
            let Some(list) = lists.get_mut(&key) else {
                return Ok(false);
            };
            let matches = list.len() >= expected.len()
                && list.iter().zip(&expected).all(|(stored, seen)| stored == seen);
            if !matches {
                return Ok(false);
            }
            list.drain(..expected.len());
            if list.is_empty() {
                lists.remove(&key);
            }
            Ok(true)
        })
    }
}
