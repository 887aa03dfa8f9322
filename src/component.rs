//! Independently versioned parts of the landscape.

pub mod manager;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use semver::Version;
use tracing::info;

use crate::error::{LsiError, is_not_found};
use crate::flow::Step;
use crate::state::SharedKeyValueState;
use crate::version::{CatalogVersion, display_version, parse_version};

pub use manager::{InstallationManager, InstallationTask};

/// A sub-system that knows which versions exist and how to install each one.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Installed version, `None` before the first install.
    async fn current_version(&self) -> Result<Option<Version>>;

    async fn target_version(&self) -> Result<Version>;

    /// Every known release, including patches that carry migrations.
    async fn versions(&self) -> Result<Vec<CatalogVersion>>;

    /// Build the step that installs exactly `version` and waits until it is
    /// healthy.
    async fn install(&self, version: &Version) -> Result<Step>;

    /// Called once the step for `version` has completed.
    async fn installed(&self, _version: &Version) -> Result<()> {
        Ok(())
    }
}

/// Builds the installation step for one version.
pub type StepFactory = Box<dyn Fn(&Version) -> Result<Step> + Send + Sync>;

/// Catalog-driven component whose installed version lives in a key-value
/// store under the component name.
pub struct VersionedComponent {
    name: String,
    target: Version,
    catalog: Vec<CatalogVersion>,
    overrides: BTreeMap<Version, StepFactory>,
    default_factory: Option<StepFactory>,
    state: SharedKeyValueState<String>,
}

impl VersionedComponent {
    pub fn new(
        name: impl Into<String>,
        target: Version,
        state: SharedKeyValueState<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            catalog: Vec::new(),
            overrides: BTreeMap::new(),
            default_factory: None,
            state,
        }
    }

    #[must_use]
    pub fn with_versions(mut self, versions: impl IntoIterator<Item = CatalogVersion>) -> Self {
        self.catalog.extend(versions);
        self
    }

    /// Add a catalog entry with its own step factory.
    #[must_use]
    pub fn with_version_factory<F>(mut self, version: CatalogVersion, factory: F) -> Self
    where
        F: Fn(&Version) -> Result<Step> + Send + Sync + 'static,
    {
        self.overrides
            .insert(version.version.clone(), Box::new(factory));
        self.catalog.push(version);
        self
    }

    #[must_use]
    pub fn with_default_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Version) -> Result<Step> + Send + Sync + 'static,
    {
        self.default_factory = Some(Box::new(factory));
        self
    }
}

#[async_trait]
impl Component for VersionedComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn current_version(&self) -> Result<Option<Version>> {
        match self.state.get(&self.name).await {
            Ok(raw) => parse_version(&raw)
                .map(Some)
                .with_context(|| format!("Stored version of {} is invalid", self.name)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn target_version(&self) -> Result<Version> {
        Ok(self.target.clone())
    }

    async fn versions(&self) -> Result<Vec<CatalogVersion>> {
        Ok(self.catalog.clone())
    }

    async fn install(&self, version: &Version) -> Result<Step> {
        let factory = self
            .overrides
            .get(version)
            .or(self.default_factory.as_ref())
            .ok_or_else(|| LsiError::NoStepFactory {
                component: self.name.clone(),
                version: display_version(version),
            })?;
        factory(version)
    }

    async fn installed(&self, version: &Version) -> Result<()> {
        self.state
            .store(&self.name, &display_version(version))
            .await?;
        info!(component = %self.name, version = %display_version(version), "Recorded installed version");
        Ok(())
    }
}

impl std::fmt::Debug for VersionedComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedComponent")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}
