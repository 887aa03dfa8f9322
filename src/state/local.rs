//! State persisted as pretty-printed JSON files on local disk.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{KeyValueState, State, StateValue, merge_over_default};
use crate::error::LsiError;

/// Single document stored in one file.
pub struct LocalState<T> {
    path: PathBuf,
    _value: PhantomData<fn() -> T>,
}

impl<T> LocalState<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_raw(&self) -> Result<Option<Value>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let value = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", self.path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        }
    }

    async fn write_raw(&self, value: &impl serde::Serialize) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create state directory {}", dir.display()))?;
        }
        let content = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Stored local state");
        Ok(())
    }
}

#[async_trait]
impl<T> State<T> for LocalState<T>
where
    T: StateValue + Default,
{
    async fn get(&self) -> Result<T> {
        match self.read_raw().await? {
            Some(stored) => merge_over_default(stored),
            None => Ok(T::default()),
        }
    }

    async fn store(&self, value: &T) -> Result<()> {
        self.write_raw(value).await
    }
}

/// Map of entries stored in one file.
///
/// The whole map is loaded on first access and rewritten on every store.
pub struct LocalKeyValueState<T> {
    file: LocalState<BTreeMap<String, T>>,
    cache: Mutex<Option<BTreeMap<String, T>>>,
}

impl<T: StateValue> LocalKeyValueState<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: LocalState::new(path),
            cache: Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, T>> {
        match self.file.read_raw().await? {
            Some(stored) => serde_json::from_value(stored)
                .with_context(|| format!("Failed to decode {}", self.file.path().display())),
            None => Ok(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl<T: StateValue> KeyValueState<T> for LocalKeyValueState<T> {
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
        let mut data = match cache.take() {
            Some(data) => data,
            None => self.load().await?,
        };
        data.insert(key.to_string(), value.clone());
        // the cache stays empty until the file holds the entry
        self.file.write_raw(&data).await?;
        *cache = Some(data);
        Ok(())
    }
}
