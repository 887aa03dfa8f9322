//! In-memory stores for tests.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{KeyValueState, State, StateValue};
use crate::error::LsiError;

/// Document store that starts empty unless seeded.
pub struct MemoryState<T> {
    value: Mutex<Option<T>>,
    writes: Mutex<Vec<T>>,
}

impl<T> Default for MemoryState<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
        }
    }
}

impl<T: StateValue> MemoryState<T> {
    pub fn with_value(value: T) -> Self {
        Self {
            value: Mutex::new(Some(value)),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Every value passed to `store`, in order.
    pub async fn writes(&self) -> Vec<T> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl<T> State<T> for MemoryState<T>
where
    T: StateValue + Default,
{
    async fn get(&self) -> Result<T> {
        Ok(self.value.lock().await.clone().unwrap_or_default())
    }

    async fn store(&self, value: &T) -> Result<()> {
        *self.value.lock().await = Some(value.clone());
        self.writes.lock().await.push(value.clone());
        Ok(())
    }
}

pub struct MemoryKeyValueState<T> {
    data: Mutex<BTreeMap<String, T>>,
}

impl<T> Default for MemoryKeyValueState<T> {
    fn default() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl<T: StateValue> KeyValueState<T> for MemoryKeyValueState<T> {
    async fn get(&self, key: &str) -> Result<T> {
        self.data
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| LsiError::NotFound(key.to_string()).into())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, T>> {
        Ok(self.data.lock().await.clone())
    }

    async fn store(&self, key: &str, value: &T) -> Result<()> {
        self.data.lock().await.insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_not_found;

    #[tokio::test]
    async fn test_memory_key_value_round_trip() {
        let kv = MemoryKeyValueState::<u32>::default();
        assert!(is_not_found(&kv.get("replicas").await.unwrap_err()));

        kv.store("replicas", &3).await.unwrap();
        kv.store("replicas", &5).await.unwrap();
        assert_eq!(kv.get("replicas").await.unwrap(), 5);
        assert_eq!(kv.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_state_records_writes() {
        let state = MemoryState::<String>::default();
        assert_eq!(state.get().await.unwrap(), "");

        state.store(&"a".to_string()).await.unwrap();
        state.store(&"b".to_string()).await.unwrap();
        assert_eq!(state.get().await.unwrap(), "b");
        assert_eq!(state.writes().await, vec!["a", "b"]);
    }
}
