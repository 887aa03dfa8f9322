//! State persisted in a Secret of the host cluster.
//!
//! Every store owns one Secret named `lsi-<store>`. Each entry is a data key
//! whose value is the JSON encoding of the entry (base64 on the wire). The
//! single-document store uses the key `state`.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use kube::api::{ObjectMeta, PostParams};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{KeyValueState, State, StateValue, merge_over_default};
use crate::error::LsiError;
use crate::retry::{BackoffConfig, retry_with_backoff};

const SECRET_PREFIX: &str = "lsi-";
const STATE_KEY: &str = "state";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub fn secret_name(store: &str) -> String {
    format!("{SECRET_PREFIX}{store}")
}

/// Encode one entry as secret data.
pub fn encode_entry<T: StateValue>(value: &T) -> Result<ByteString> {
    Ok(ByteString(serde_json::to_vec(value)?))
}

pub fn decode_entry<T: StateValue>(key: &str, raw: &ByteString) -> Result<T> {
    serde_json::from_slice(&raw.0).with_context(|| format!("Failed to decode state entry {key}"))
}

/// Build a new Secret holding `data`.
pub fn new_secret(namespace: &str, name: &str, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                env!("CARGO_PKG_NAME").to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Raw access to the backing Secret.
struct SecretStore {
    api: Api<Secret>,
    namespace: String,
    name: String,
    backoff: BackoffConfig,
}

impl SecretStore {
    fn new(client: kube::Client, namespace: &str, store: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: secret_name(store),
            backoff: BackoffConfig::default(),
        }
    }

    /// Read the Secret data. An absent Secret reads as empty.
    async fn read(&self) -> Result<BTreeMap<String, ByteString>> {
        let found = OnceLock::new();
        let (api, name, slot) = (&self.api, self.name.as_str(), &found);

        retry_with_backoff(&self.backoff, &format!("read secret {name}"), move || async move {
            match api.get_opt(name).await {
                Ok(secret) => {
                    let _ = slot.set(secret.and_then(|s| s.data).unwrap_or_default());
                    Ok(true)
                }
                Err(e) => {
                    warn!(secret = %name, "Unable to read state secret: {}", e);
                    Ok(false)
                }
            }
        })
        .await?;

        Ok(found.into_inner().unwrap_or_default())
    }

    /// Insert entries into the Secret, creating it when absent.
    async fn write(&self, entries: &BTreeMap<String, ByteString>) -> Result<()> {
        let name = self.name.as_str();
        retry_with_backoff(&self.backoff, &format!("write secret {name}"), move || async move {
            match self.try_write(entries).await {
                Ok(()) => Ok(true),
                Err(e) => {
                    warn!(secret = %name, "Unable to store state secret: {:#}", e);
                    Ok(false)
                }
            }
        })
        .await?;
        info!(secret = %name, namespace = %self.namespace, "Successfully stored state");
        Ok(())
    }

    async fn try_write(&self, entries: &BTreeMap<String, ByteString>) -> Result<()> {
        let params = PostParams::default();
        match self.api.get_opt(&self.name).await? {
            Some(mut secret) => {
                // resourceVersion from the read guards against lost updates
                secret
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
                self.api
                    .replace(&self.name, &params, &secret)
                    .await
                    .map_err(|e| LsiError::KubernetesApi(format!("replace {}: {e}", self.name)))?;
            }
            None => {
                let secret = new_secret(&self.namespace, &self.name, entries.clone());
                self.api
                    .create(&params, &secret)
                    .await
                    .map_err(|e| LsiError::KubernetesApi(format!("create {}: {e}", self.name)))?;
            }
        }
        Ok(())
    }
}

/// Single document stored under the `state` key.
pub struct KubernetesState<T> {
    secret: SecretStore,
    _value: PhantomData<fn() -> T>,
}

impl<T> KubernetesState<T> {
    pub fn new(client: kube::Client, namespace: &str, store: &str) -> Self {
        Self {
            secret: SecretStore::new(client, namespace, store),
            _value: PhantomData,
        }
    }
}

#[async_trait]
impl<T> State<T> for KubernetesState<T>
where
    T: StateValue + Default,
{
    async fn get(&self) -> Result<T> {
        let data = self.secret.read().await?;
        match data.get(STATE_KEY) {
            Some(raw) => {
                let stored = decode_entry::<serde_json::Value>(STATE_KEY, raw)?;
                merge_over_default(stored)
            }
            None => Ok(T::default()),
        }
    }

    async fn store(&self, value: &T) -> Result<()> {
        let entries = BTreeMap::from([(STATE_KEY.to_string(), encode_entry(value)?)]);
        self.secret.write(&entries).await
    }
}

/// One Secret data entry per key. Entries are cached after the first read.
pub struct KubernetesKeyValueState<T> {
    secret: SecretStore,
    cache: Mutex<Option<BTreeMap<String, T>>>,
}

impl<T: StateValue> KubernetesKeyValueState<T> {
    pub fn new(client: kube::Client, namespace: &str, store: &str) -> Self {
        Self {
            secret: SecretStore::new(client, namespace, store),
            cache: Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, T>> {
        self.secret
            .read()
            .await?
            .iter()
            .map(|(key, raw)| decode_entry(key, raw).map(|value| (key.clone(), value)))
            .collect()
    }
}

#[async_trait]
impl<T: StateValue> KeyValueState<T> for KubernetesKeyValueState<T> {
    async fn get(&self, key: &str) -> Result<T> {
        self.get_all()
            .await?
            .remove(key)
            .ok_or_else(|| LsiError::NotFound(key.to_string()).into())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, T>> {
        let mut cache = self.cache.lock().await;
        if let Some(data) = cache.as_ref() {
            return Ok(data.clone());
        }
        let data = self.load().await?;
        *cache = Some(data.clone());
        Ok(data)
    }

    async fn store(&self, key: &str, value: &T) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let entries = BTreeMap::from([(key.to_string(), encode_entry(value)?)]);
        self.secret.write(&entries).await?;
        if let Some(data) = cache.as_mut() {
            data.insert(key.to_string(), value.clone());
        }
        Ok(())
    }
}
