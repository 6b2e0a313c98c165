use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Hash fields as written to the store: field name to encoded value.
pub type Fields = Vec<(String, String)>;

/// When a string value stops being visible.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expiry {
    Never,
    /// Relative to the write. A zero duration deletes the key.
    After(Duration),
}

/// Minimal key-value surface the cache driver needs.
///
/// Keys passed in are always fully qualified (prefix included). The guarded
/// operations must be atomic with respect to every other operation on the
/// same key.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Short name of the server behind the store, for logging only.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Fetch several string keys at once, in order. Missing keys are `None`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> Result<()>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Delete a string key only if it still holds `expected`. Returns
    /// whether it was deleted.
    async fn delete_if_unchanged(&self, key: &str, expected: &str) -> Result<bool>;

    /// Every key starting with `prefix`, in no particular order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// All fields of a hash, or an empty map when the key is absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Replace the whole hash with `fields`.
    async fn hash_replace(&self, key: &str, fields: &Fields) -> Result<()>;

    /// Set fields only if the hash exists. Returns whether it did.
    async fn hash_set_existing(&self, key: &str, fields: &Fields) -> Result<bool>;

    /// Add each delta to its integer field only if the hash exists. Returns
    /// whether it did.
    async fn hash_increment_existing(&self, key: &str, deltas: &[(&str, i64)]) -> Result<bool>;

    /// Delete a hash only if its fields are exactly `expected`. Returns
    /// whether it was deleted.
    async fn hash_delete_if_unchanged(&self, key: &str, expected: &HashMap<String, String>) -> Result<bool>;

    async fn close(&self);
}
