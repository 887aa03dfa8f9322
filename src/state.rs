//! Durable installer state.
//!
//! Two shapes of storage are offered: [`State`] holds one document, and
//! [`KeyValueState`] holds independently updated entries. Both are backed
//! either by local JSON files (dry runs, development) or by a Secret in the
//! host cluster.

pub mod kubernetes;
pub mod local;
#[cfg(test)]
pub mod memory;
pub mod namespaced;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::values::deep_merge;

pub use kubernetes::{KubernetesKeyValueState, KubernetesState};
pub use local::{LocalKeyValueState, LocalState};
pub use namespaced::NamespacedKeyValueState;

/// Values that can be persisted by a state backend.
pub trait StateValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> StateValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A single persisted document.
#[async_trait]
pub trait State<T: StateValue>: Send + Sync {
    /// Load the document. Absent storage yields the empty default; stored
    /// documents are merged over it so newly added fields are populated.
    async fn get(&self) -> Result<T>;

    /// Replace the stored document.
    async fn store(&self, value: &T) -> Result<()>;
}

/// Independently addressable persisted entries.
#[async_trait]
pub trait KeyValueState<T: StateValue>: Send + Sync {
    /// Fails with [`crate::error::LsiError::NotFound`] for a missing key.
    async fn get(&self, key: &str) -> Result<T>;

    async fn get_all(&self) -> Result<BTreeMap<String, T>>;

    /// Insert or overwrite `key`.
    async fn store(&self, key: &str, value: &T) -> Result<()>;
}

pub type SharedState<T> = Arc<dyn State<T>>;
pub type SharedKeyValueState<T> = Arc<dyn KeyValueState<T>>;

/// Decode a stored document by merging it over `T::default()`.
pub(crate) fn merge_over_default<T>(stored: Value) -> Result<T>
where
    T: StateValue + Default,
{
    let mut merged =
        serde_json::to_value(T::default()).context("Failed to serialize empty state")?;
    deep_merge(&mut merged, stored);
    serde_json::from_value(merged).context("Failed to decode stored state")
}

/// Logical stores persisted by the installer.
pub mod names {
    pub const STATE: &str = "state";
    pub const HELM: &str = "helm-state";
    pub const KUBE_APPLY: &str = "kube-apply-state";
    pub const COMPONENT: &str = "component-state";
}

/// Where state is persisted.
#[derive(Clone)]
pub enum StateBackend {
    /// `<dir>/<name>.json`
    Local { dir: PathBuf },
    /// Secret `lsi-<name>` in `namespace`.
    Kubernetes {
        client: kube::Client,
        namespace: String,
    },
}

impl StateBackend {
    /// Pick the backend for a run. Dry runs never touch the cluster.
    pub fn select(
        dry_run: bool,
        state_dir: PathBuf,
        client: Option<kube::Client>,
        namespace: &str,
    ) -> Self {
        match client {
            Some(client) if !dry_run => Self::Kubernetes {
                client,
                namespace: namespace.to_string(),
            },
            _ => Self::Local { dir: state_dir },
        }
    }

    pub fn state<T>(&self, name: &str) -> SharedState<T>
    where
        T: StateValue + Default,
    {
        match self {
            Self::Local { dir } => Arc::new(LocalState::new(dir.join(format!("{name}.json")))),
            Self::Kubernetes { client, namespace } => {
                Arc::new(KubernetesState::new(client.clone(), namespace, name))
            }
        }
    }

    pub fn key_value<T: StateValue>(&self, name: &str) -> SharedKeyValueState<T> {
        match self {
            Self::Local { dir } => {
                Arc::new(LocalKeyValueState::new(dir.join(format!("{name}.json"))))
            }
            Self::Kubernetes { client, namespace } => {
                Arc::new(KubernetesKeyValueState::new(client.clone(), namespace, name))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Local { dir } => format!("local directory {}", dir.display()),
            Self::Kubernetes { namespace, .. } => format!("secrets in namespace {namespace}"),
        }
    }
}

impl std::fmt::Debug for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        version: String,
        #[serde(default)]
        replicas: u32,
        extra: BTreeMap<String, String>,
    }

    #[test]
    fn test_merge_over_default_fills_missing_fields() {
        let doc: Doc = merge_over_default(json!({"version": "v1.2.3"})).unwrap();
        assert_eq!(
            doc,
            Doc {
                version: "v1.2.3".to_string(),
                ..Doc::default()
            }
        );
    }

    #[test]
    fn test_select_backend() {
        let backend = StateBackend::select(true, PathBuf::from("/tmp/lsi"), None, "garden");
        assert!(matches!(backend, StateBackend::Local { ref dir } if dir == &PathBuf::from("/tmp/lsi")));

        let backend = StateBackend::select(false, PathBuf::from("state"), None, "garden");
        assert_eq!(backend.describe(), "local directory state");
    }

    #[tokio::test]
    async fn test_local_backend_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::Local {
            dir: dir.path().to_path_buf(),
        };

        let kv = backend.key_value::<String>(names::COMPONENT);
        kv.store("gardener", &"v1.61.0".to_string()).await.unwrap();
        let state = backend.state::<Doc>(names::STATE);
        state.store(&Doc::default()).await.unwrap();

        assert!(dir.path().join("component-state.json").exists());
        assert!(dir.path().join("state.json").exists());
    }
}
