//! [`KeyValueStore`] over a Redis server.

use super::store::{Expiry, Fields, KeyValueStore};
use crate::connection::ConnectionDescriptor;
use crate::error::{Error, ErrorKind, Result};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

const DEFAULT_PORT: u16 = 6379;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_BATCH: usize = 500;

const HASH_SET_EXISTING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

const HASH_INCREMENT_EXISTING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
for i = 1, #ARGV, 2 do
    redis.call('HINCRBY', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 1
"#;

const DELETE_IF_UNCHANGED: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
return redis.call('DEL', KEYS[1])
"#;

const HASH_DELETE_IF_UNCHANGED: &str = r#"
local current = redis.call('HGETALL', KEYS[1])
if #current ~= #ARGV then
    return 0
end
local expected = {}
for i = 1, #ARGV, 2 do
    expected[ARGV[i]] = ARGV[i + 1]
end
for i = 1, #current, 2 do
    if expected[current[i]] ~= current[i + 1] then
        return 0
    end
end
return redis.call('DEL', KEYS[1])
"#;

fn command_failed(err: redis::RedisError) -> Error {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        ErrorKind::Connection("redis")
    } else {
        ErrorKind::Database
    };
    exn::Exn::from(err).raise(kind)
}

/// Escape glob metacharacters so a key prefix matches literally in `SCAN`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

/// Build the client URL from a descriptor. Credentials are re-encoded by
/// the url crate so reserved characters survive.
fn client_url(descriptor: &ConnectionDescriptor) -> Result<Url> {
    let scheme = if descriptor.use_ssl { "rediss" } else { "redis" };
    let mut url = Url::parse(&format!("{scheme}://{}/", descriptor.host))
        .or_raise(|| ErrorKind::InvalidConnection(format!("invalid redis host `{}`", descriptor.host)))?;
    if url.port().is_none() {
        _ = url.set_port(Some(DEFAULT_PORT));
    }
    if !descriptor.username.is_empty() {
        _ = url.set_username(&descriptor.username);
    }
    if !descriptor.password.is_empty() {
        _ = url.set_password(Some(&descriptor.password));
    }
    Ok(url)
}

/// Redis connection shared by all tasks. The connection manager reconnects
/// on its own; once closed the store refuses further commands.
pub struct RedisStore {
    connection: RwLock<Option<ConnectionManager>>,
    hash_set_existing: Script,
    hash_increment_existing: Script,
    delete_if_unchanged: Script,
    hash_delete_if_unchanged: Script,
}

impl RedisStore {
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let url = client_url(descriptor)?;
        let client = Client::open(url.as_str()).or_raise(|| ErrorKind::Connection("redis"))?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(RESPONSE_TIMEOUT);
        let manager = tokio::time::timeout(CONNECT_TIMEOUT, client.get_connection_manager_with_config(config))
            .await
            .or_raise(|| ErrorKind::Timeout)?
            .or_raise(|| ErrorKind::Connection("redis"))?;
        tracing::debug!(server = %descriptor, "Connected to Redis");
        Ok(Self {
            connection: RwLock::new(Some(manager)),
            hash_set_existing: Script::new(HASH_SET_EXISTING),
            hash_increment_existing: Script::new(HASH_INCREMENT_EXISTING),
            delete_if_unchanged: Script::new(DELETE_IF_UNCHANGED),
            hash_delete_if_unchanged: Script::new(HASH_DELETE_IF_UNCHANGED),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.connection.read().await.clone().ok_or_raise(|| ErrorKind::Closed)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(command_failed)?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let values: Vec<Option<String>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await.map_err(command_failed)?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        match expiry {
            Expiry::Never => {},
            Expiry::After(ttl) if ttl.is_zero() => {
                // Already expired: nothing to store.
                let _: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await.map_err(command_failed)?;
                return Ok(());
            },
            Expiry::After(ttl) => {
                cmd.arg("EX").arg(ttl.as_secs().max(1));
            },
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(command_failed)?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await.map_err(command_failed)?;
        Ok(removed)
    }

    async fn delete_if_unchanged(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 =
            self.delete_if_unchanged.key(key).arg(expected).invoke_async(&mut conn).await.map_err(command_failed)?;
        Ok(removed == 1)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = glob_escape(prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(command_failed)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await.map_err(command_failed)?;
        Ok(fields)
    }

    async fn hash_replace(&self, key: &str, fields: &Fields) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(key, fields).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(command_failed)?;
        Ok(())
    }

    async fn hash_set_existing(&self, key: &str, fields: &Fields) -> Result<bool> {
        if fields.is_empty() {
            return Ok(false);
        }
        let mut conn = self.connection().await?;
        let mut invocation = self.hash_set_existing.prepare_invoke();
        invocation.key(key);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await.map_err(command_failed)?;
        Ok(applied == 1)
    }

    async fn hash_increment_existing(&self, key: &str, deltas: &[(&str, i64)]) -> Result<bool> {
        let mut conn = self.connection().await?;
        let mut invocation = self.hash_increment_existing.prepare_invoke();
        invocation.key(key);
        for (field, delta) in deltas {
            invocation.arg(*field).arg(*delta);
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await.map_err(command_failed)?;
        Ok(applied == 1)
    }

    async fn hash_delete_if_unchanged(&self, key: &str, expected: &HashMap<String, String>) -> Result<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let mut conn = self.connection().await?;
        let mut invocation = self.hash_delete_if_unchanged.prepare_invoke();
        invocation.key(key);
        for (field, value) in expected {
            invocation.arg(field).arg(value);
        }
        let removed: i64 = invocation.invoke_async(&mut conn).await.map_err(command_failed)?;
        Ok(removed == 1)
    }

    async fn close(&self) {
        if self.connection.write().await.take().is_some() {
            tracing::debug!("Closed Redis connection");
        }
    }
}
