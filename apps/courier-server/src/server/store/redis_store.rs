use futures_util::future::BoxFuture;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use super::{RegistryStore, StoreError};

const COMPARE_AND_DELETE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const DROP_PREFIX_SCRIPT: &str = r"
local count = #ARGV
local head = redis.call('LRANGE', KEYS[1], 0, count - 1)
if #head ~= count then
    return 0
end
for i = 1, count do
    if head[i] ~= ARGV[i] then
        return 0
    end
end
redis.call('LTRIM', KEYS[1], count, -1)
return 1
";

/// Redis-backed registry. Connects on first use so the server can start
/// while Redis is still coming up.
pub(crate) struct RedisStore {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisStore {
    pub(crate) fn open(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.manager
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|err| StoreError::Unavailable(err.to_string()))?;
                tracing::info!(event = "store.redis.connected");
                Ok(manager)
            })
            .await
            .cloned()
    }
}

fn command_error(err: &redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

impl RegistryStore for RedisStore {
    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.to_owned();
        let value = value.to_owned();
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .query_async(&mut conn)
                .await
                .map_err(|err| command_error(&err))?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let value: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|err| command_error(&err))?;
            Ok(value)
        })
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.to_owned();
        let expected = expected.to_owned();
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let deleted: i64 = redis::cmd("EVAL")
                .arg(COMPARE_AND_DELETE_SCRIPT)
                .arg(1)
                .arg(&key)
                .arg(&expected)
                .query_async(&mut conn)
                .await
                .map_err(|err| command_error(&err))?;
            Ok(deleted > 0)
        })
    }

    fn list_push(&self, key: &str, value: &str) -> BoxFuture<'_, Result<usize, StoreError>> {
        let key = key.to_owned();
        let value = value.to_owned();
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let len: usize = redis::cmd("RPUSH")
                .arg(&key)
                .arg(&value)
                .query_async(&mut conn)
                .await
                .map_err(|err| command_error(&err))?;
            Ok(len)
        })
    }

    fn list_range(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let entries: Vec<String> = redis::cmd("LRANGE")
                .arg(&key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await
                .map_err(|err| command_error(&err))?;
            Ok(entries)
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
            let mut conn = self.connection().await?;
            let dropped: i64 = redis::cmd("EVAL")
                .arg(DROP_PREFIX_SCRIPT)
                .arg(1)
                .arg(&key)
                .arg(&expected)
                .query_async(&mut conn)
                .await
                .map_err(|err| command_error(&err))?;
            Ok(dropped > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::RedisStore;
    use crate::server::store::{RegistryStore, StoreError};

    fn test_store() -> Option<RedisStore> {
        let url = std::env::var("COURIER_TEST_REDIS_URL").ok()?;
        Some(RedisStore::open(&url).expect("test redis url should parse"))
    }

    #[test]
    fn rejects_unparsable_url() {
        assert!(matches!(
            RedisStore::open("not a redis url"),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn compare_and_delete_against_live_redis() {
        let Some(store) = test_store() else {
            return;
        };
        let key = format!("online:test-{}", Uuid::new_v4());
        store.set(&key, "conn-1").await.unwrap();
        assert!(!store.delete_if_equals(&key, "conn-2").await.unwrap());
        assert!(store.delete_if_equals(&key, "conn-1").await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_prefix_trim_against_live_redis() {
        let Some(store) = test_store() else {
            return;
        };
        let key = format!("offline_msgs:test-{}", Uuid::new_v4());
        assert_eq!(store.list_push(&key, "a").await.unwrap(), 1);
        assert_eq!(store.list_push(&key, "b").await.unwrap(), 2);
        let snapshot = store.list_range(&key).await.unwrap();
        store.list_push(&key, "c").await.unwrap();

        assert!(store.list_drop_prefix(&key, &snapshot).await.unwrap());
        assert_eq!(store.list_range(&key).await.unwrap(), vec![String::from("c")]);

        assert!(!store.list_drop_prefix(&key, &snapshot).await.unwrap());
        assert_eq!(store.list_range(&key).await.unwrap(), vec![String::from("c")]);
        assert!(store
            .list_drop_prefix(&key, &[String::from("c")])
            .await
            .unwrap());
        assert!(store.list_range(&key).await.unwrap().is_empty());
    }
}
