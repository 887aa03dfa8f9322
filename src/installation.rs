//! Versioned landscape installations.
//!
//! An [`Installation`] brings persisted state up to the target release by
//! running every migration between the stored and the target version, merges
//! the user's input over it, persists the result and appends the landscape
//! steps to the flow.

pub mod migrations;
pub mod registry;

use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::LsiError;
use crate::flow::{Flow, Step};
use crate::state::State;
use crate::values::merge_maps;
use crate::version::{display_version, parse_version};

pub use registry::InstallationRegistry;

/// Top-level sections every stored state carries.
const REQUIRED_SECTIONS: &[&str] = &["etcd", "apiserver", "gardener"];

/// Persisted landscape state: the installed version and the rendered values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionedState {
    #[serde(default)]
    pub version: String,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl VersionedState {
    /// State of a landscape that was never installed.
    pub fn empty(version: &Version) -> Self {
        let values = match serde_json::json!({
            "identity": {},
            "gardener-dashboard": {},
            "etcd": {},
            "apiserver": {
                "admin": {},
                "aggregator": {},
            },
            "gardener": {},
        }) {
            Value::Object(values) => values,
            _ => Map::new(),
        };
        Self {
            version: display_version(version),
            values,
        }
    }

    /// True if nothing was stored yet.
    pub fn is_unset(&self) -> bool {
        self.version.is_empty() && self.values.is_empty()
    }

    pub fn parsed_version(&self) -> Option<Version> {
        parse_version(&self.version).ok()
    }

    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = REQUIRED_SECTIONS
            .iter()
            .copied()
            .filter(|key| !self.values.get(*key).is_some_and(Value::is_object))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LsiError::InvalidState(format!("missing sections: {}", missing.join(", "))).into())
        }
    }

    /// All values including `version`, as one object.
    pub fn to_value(&self) -> Value {
        let mut values = self.values.clone();
        values.insert("version".to_string(), Value::String(self.version.clone()));
        Value::Object(values)
    }
}

/// Turns rendered state into the steps that deploy the landscape.
pub trait StepRenderer: Send + Sync {
    /// `apiserver_upgrades` lists virtual cluster versions, ascending, that
    /// must be rolled out before the version recorded in `state`.
    fn render(&self, state: &VersionedState, apiserver_upgrades: &[Version]) -> Result<Vec<Step>>;
}

/// State brought to the target release.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prepared {
    pub state: VersionedState,
    pub apiserver_upgrades: Vec<Version>,
}

/// Installation of one release line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    line: Version,
}

impl Installation {
    pub const fn new(line: Version) -> Self {
        Self { line }
    }

    pub const fn line(&self) -> &Version {
        &self.line
    }

    /// Load persisted state and bring it to `target`. A first install starts
    /// from [`VersionedState::empty`] without running any migration.
    pub fn prepare(&self, stored: VersionedState, target: &Version) -> Result<Prepared> {
        if stored.is_unset() {
            info!("No previous installation found, starting with empty state");
            return Ok(Prepared {
                state: VersionedState::empty(target),
                apiserver_upgrades: Vec::new(),
            });
        }

        stored.validate()?;
        let mut state = stored;
        if state.parsed_version().is_none() {
            info!(stored = %state.version, "Stored state has no valid version, running all migrations");
        }
        let migrated = migrations::migrate(&mut state, target)?;
        info!(
            from = %state.version,
            to = %display_version(target),
            migrations = migrated.applied.len(),
            "Migrated state"
        );
        Ok(Prepared {
            state,
            apiserver_upgrades: migrated.apiserver_upgrades,
        })
    }

    /// Migrate, merge input over state (input wins), persist, then append the
    /// rendered steps to `flow`.
    pub async fn install(
        &self,
        flow: &mut Flow,
        state: &dyn State<VersionedState>,
        target: &Version,
        input: Map<String, Value>,
        renderer: &dyn StepRenderer,
    ) -> Result<VersionedState> {
        info!(
            line = %display_version(&self.line),
            target = %display_version(target),
            "Installing landscape"
        );
        let stored = state.get().await.context("Failed to load installation state")?;
        let Prepared {
            state: mut rendered,
            apiserver_upgrades,
        } = self.prepare(stored, target)?;

        merge_maps(&mut rendered.values, input);
        rendered.values.remove("version");
        rendered.version = display_version(target);

        state
            .store(&rendered)
            .await
            .context("Failed to persist installation state")?;

        flow.add_steps(renderer.render(&rendered, &apiserver_upgrades)?)?;
        Ok(rendered)
    }
}
