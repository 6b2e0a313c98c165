//! In-process [`KeyValueStore`], for tests and for crates that want a cache
//! driver without a server (cargo feature `mock`).

use super::store::{Expiry, Fields, KeyValueStore};
use crate::error::{ErrorKind, Result};
use crate::models;
use async_trait::async_trait;
use exn::ResultExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Clone, Debug)]
enum Value {
    String { value: String, expires_at: Option<i64> },
    Hash(HashMap<String, String>),
}

impl Value {
    fn is_live(&self, now: i64) -> bool {
        match self {
            Self::String { expires_at: Some(at), .. } => *at > now,
            _ => true,
        }
    }
}

/// Key-value store held in memory. Expired keys are dropped lazily on the
/// next access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Value>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::Closed);
        }
        Ok(())
    }

    async fn live(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let now = models::now();
        let data = self.data.read().await;
        Ok(data.get(key).filter(|value| value.is_live(now)).cloned())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live(key).await? {
            Some(Value::String { value, .. }) => Ok(Some(value)),
            Some(Value::Hash(_)) => exn::bail!(ErrorKind::InvalidData("expected a string value")),
            None => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.ensure_open()?;
        let now = models::now();
        let data = self.data.read().await;
        // Like MGET: anything that is not a live string reads as missing.
        Ok(keys
            .iter()
            .map(|key| match data.get(key) {
                Some(Value::String { value, expires_at }) if expires_at.is_none_or(|at| at > now) => {
                    Some(value.clone())
                },
                _ => None,
            })
            .collect())
    }

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> Result<()> {
        self.ensure_open()?;
        let now = models::now();
        let expires_at = match expiry {
            Expiry::Never => None,
            Expiry::After(ttl) => Some(now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))),
        };
        let mut data = self.data.write().await;
        if expires_at.is_some_and(|at| at <= now) {
            data.remove(key);
        } else {
            data.insert(key.to_string(), Value::String { value: value.to_string(), expires_at });
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.ensure_open()?;
        let now = models::now();
        let mut data = self.data.write().await;
        let mut removed = 0;
        for key in keys {
            if data.remove(key).is_some_and(|value| value.is_live(now)) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_if_unchanged(&self, key: &str, expected: &str) -> Result<bool> {
        self.ensure_open()?;
        let now = models::now();
        let mut data = self.data.write().await;
        let unchanged = match data.get(key) {
            Some(Value::String { value, expires_at }) => value == expected && expires_at.is_none_or(|at| at > now),
            _ => false,
        };
        if unchanged {
            data.remove(key);
        }
        Ok(unchanged)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let now = models::now();
        let mut data = self.data.write().await;
        data.retain(|_, value| value.is_live(now));
        Ok(data.keys().filter(|key| key.starts_with(prefix)).cloned().collect())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        match self.live(key).await? {
            Some(Value::Hash(fields)) => Ok(fields),
            Some(Value::String { .. }) => exn::bail!(ErrorKind::InvalidData("expected a hash value")),
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_replace(&self, key: &str, fields: &Fields) -> Result<()> {
        self.ensure_open()?;
        let fields = fields.iter().cloned().collect();
        self.data.write().await.insert(key.to_string(), Value::Hash(fields));
        Ok(())
    }

    async fn hash_set_existing(&self, key: &str, fields: &Fields) -> Result<bool> {
        self.ensure_open()?;
        let mut data = self.data.write().await;
        let Some(Value::Hash(existing)) = data.get_mut(key) else {
            return Ok(false);
        };
        existing.extend(fields.iter().cloned());
        Ok(true)
    }

    async fn hash_increment_existing(&self, key: &str, deltas: &[(&str, i64)]) -> Result<bool> {
        self.ensure_open()?;
        let mut data = self.data.write().await;
        let Some(Value::Hash(existing)) = data.get_mut(key) else {
            return Ok(false);
        };
        // Validate everything first so a bad field leaves the hash untouched.
        let mut updated = Vec::with_capacity(deltas.len());
        for (field, delta) in deltas {
            let current = match existing.get(*field) {
                Some(raw) => raw.parse::<i64>().or_raise(|| ErrorKind::InvalidData("hash field is not an integer"))?,
                None => 0,
            };
            updated.push((field.to_string(), (current + delta).to_string()));
        }
        existing.extend(updated);
        Ok(true)
    }

    async fn hash_delete_if_unchanged(&self, key: &str, expected: &HashMap<String, String>) -> Result<bool> {
        self.ensure_open()?;
        let mut data = self.data.write().await;
        let unchanged = !expected.is_empty() && matches!(data.get(key), Some(Value::Hash(fields)) if fields == expected);
        if unchanged {
            data.remove(key);
        }
        Ok(unchanged)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.data.write().await.clear();
        }
    }
}
