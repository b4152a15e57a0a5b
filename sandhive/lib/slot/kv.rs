use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::SandhiveResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single key as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// The key.
    pub key: String,

    /// The stored value.
    pub value: String,

    /// The index of the last write, used for compare-and-set deletes.
    pub modify_index: u64,
}

/// A consistent key-value store with compare-and-set writes.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Creates `key` with `value` only if it does not exist yet. Returns whether it was created.
    async fn create_cas(&self, key: &str, value: &str) -> SandhiveResult<bool>;

    /// Reads a key.
    async fn get(&self, key: &str) -> SandhiveResult<Option<KvEntry>>;

    /// Deletes `key` only if it was last written at `modify_index`. Returns whether it was deleted.
    async fn delete_cas(&self, key: &str, modify_index: u64) -> SandhiveResult<bool>;

    /// Lists every key starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> SandhiveResult<Vec<String>>;
}

/// An in-process store, for single-node setups and tests.
#[derive(Debug, Default)]
pub struct MemoryKv {
    inner: Mutex<MemoryKvInner>,
}

#[derive(Debug, Default)]
struct MemoryKvInner {
    entries: BTreeMap<String, (String, u64)>,
    last_index: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a key unconditionally.
    pub async fn put(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().await;
        inner.last_index += 1;
        let index = inner.last_index;
        inner
            .entries
            .insert(key.to_string(), (value.to_string(), index));
    }

    /// Returns the number of keys.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Whether the store holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl KvStore for MemoryKv {
    async fn create_cas(&self, key: &str, value: &str) -> SandhiveResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(key) {
            return Ok(false);
        }

        inner.last_index += 1;
        let index = inner.last_index;
        inner
            .entries
            .insert(key.to_string(), (value.to_string(), index));
        Ok(true)
    }

    async fn get(&self, key: &str) -> SandhiveResult<Option<KvEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(key).map(|(value, index)| KvEntry {
            key: key.to_string(),
            value: value.clone(),
            modify_index: *index,
        }))
    }

    async fn delete_cas(&self, key: &str, modify_index: u64) -> SandhiveResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.entries.get(key) {
            Some((_, index)) if *index == modify_index => {
                inner.entries.remove(key);
                Ok(true)
            }
            Some(_) => Ok(false),
            // Consul reports success when deleting a missing key.
            None => Ok(true),
        }
    }

    async fn list_keys(&self, prefix: &str) -> SandhiveResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_kv_cas_semantics() -> anyhow::Result<()> {
        let kv = MemoryKv::new();
        assert!(kv.create_cas("n/1", "a").await?);
        assert!(!kv.create_cas("n/1", "b").await?);

        let entry = kv.get("n/1").await?.expect("key exists");
        assert_eq!(entry.value, "a");

        assert!(!kv.delete_cas("n/1", entry.modify_index + 1).await?);
        assert!(kv.delete_cas("n/1", entry.modify_index).await?);
        assert!(kv.get("n/1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_kv_lists_by_prefix() -> anyhow::Result<()> {
        let kv = MemoryKv::new();
        kv.put("n/1", "a").await;
        kv.put("n/2", "b").await;
        kv.put("m/1", "c").await;

        assert_eq!(kv.list_keys("n/").await?, vec!["n/1", "n/2"]);
        assert_eq!(kv.len().await, 3);
        Ok(())
    }
}
