//! Key prefixing on top of another key-value store.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use super::{KeyValueState, SharedKeyValueState, StateValue};

/// Stores every key as `<namespace>.<key>` in the wrapped store, so several
/// owners can share one backing store without clashing.
pub struct NamespacedKeyValueState<T> {
    inner: SharedKeyValueState<T>,
    namespace: String,
}

impl<T: StateValue> NamespacedKeyValueState<T> {
    pub fn new(inner: SharedKeyValueState<T>, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    fn namespaced_key(&self, key: &str) -> String {
        format!("{}.{key}", self.namespace)
    }
}

#[async_trait]
impl<T: StateValue> KeyValueState<T> for NamespacedKeyValueState<T> {
    async fn get(&self, key: &str) -> Result<T> {
        self.inner.get(&self.namespaced_key(key)).await
    }

    async fn get_all(&self) -> Result<BTreeMap<String, T>> {
        let prefix = format!("{}.", self.namespace);
        Ok(self
            .inner
            .get_all()
            .await?
            .into_iter()
            .filter_map(|(key, value)| key.strip_prefix(&prefix).map(|k| (k.to_string(), value)))
            .collect())
    }

    async fn store(&self, key: &str, value: &T) -> Result<()> {
        self.inner.store(&self.namespaced_key(key), value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_not_found;
    use crate::state::memory::MemoryKeyValueState;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_keys_are_prefixed() {
        let inner = Arc::new(MemoryKeyValueState::<String>::default());
        let garden = NamespacedKeyValueState::new(inner.clone(), "garden");
        let shoot = NamespacedKeyValueState::new(inner.clone(), "shoot");

        garden.store("etcd", &"v3.5.9".to_string()).await.unwrap();
        shoot.store("etcd", &"v3.4.26".to_string()).await.unwrap();

        assert_eq!(inner.get("garden.etcd").await.unwrap(), "v3.5.9");
        assert_eq!(garden.get("etcd").await.unwrap(), "v3.5.9");
        assert_eq!(shoot.get("etcd").await.unwrap(), "v3.4.26");
        assert!(is_not_found(&garden.get("gardener").await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_get_all_strips_namespace() {
        let inner = Arc::new(MemoryKeyValueState::<String>::default());
        inner.store("other", &"x".to_string()).await.unwrap();
        let garden = NamespacedKeyValueState::new(inner.clone(), "garden");
        garden.store("etcd", &"v3.5.9".to_string()).await.unwrap();

        let all = garden.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["etcd"], "v3.5.9");
    }
}
