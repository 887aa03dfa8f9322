//! State migrations tied to the landscape release that introduced them.

use anyhow::Result;
use semver::Version;
use serde_json::{Map, Value};
use tracing::info;

use super::VersionedState;
use crate::error::LsiError;
use crate::version::{display_version, parse_version};

/// Digest required for CA certificates from 1.47 on.
const REQUIRED_DIGEST: &str = "sha384";

/// Assumed virtual cluster version for states written before it was recorded.
const UNRECORDED_APISERVER_VERSION: Version = Version::new(1, 18, 2);

/// A one-way transformation of persisted state. `apply` returns the virtual
/// cluster versions that must be rolled out, in order, before the version it
/// leaves in the state.
#[derive(Clone)]
pub struct Migration {
    pub introduced: Version,
    pub description: &'static str,
    pub apply: fn(&mut VersionedState) -> Result<Vec<Version>>,
}

/// What [`migrate`] did to a state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Migrated {
    /// Versions of the migrations that ran, ascending.
    pub applied: Vec<Version>,
    /// Intermediate virtual cluster versions, ascending.
    pub apiserver_upgrades: Vec<Version>,
}

impl Migration {
    /// True if the migration lies between the stored and the target version.
    /// A state without a usable version has not seen any migration yet.
    pub fn applies(&self, stored: Option<&Version>, target: &Version) -> bool {
        let introduced = core(&self.introduced);
        stored.is_none_or(|s| core(s) < introduced) && introduced <= core(target)
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("introduced", &self.introduced)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// major.minor.patch without pre-release or build metadata.
fn core(v: &Version) -> Version {
    Version::new(v.major, v.minor, v.patch)
}

/// All migrations, ascending by the version that introduced them.
pub fn all() -> Vec<Migration> {
    vec![
        Migration {
            introduced: Version::new(1, 47, 0),
            description: "regenerate certificates not signed with sha384",
            apply: drop_weak_certificates,
        },
        Migration {
            introduced: Version::new(1, 50, 0),
            description: "drop retired UseDNSRecords feature gate",
            apply: drop_dns_records_feature_gate,
        },
        Migration {
            introduced: Version::new(1, 51, 0),
            description: "virtual cluster at least v1.21.14",
            apply: |state| {
                raise_apiserver_version(
                    state,
                    &Version::new(1, 21, 14),
                    &[Version::new(1, 19, 16), Version::new(1, 20, 15)],
                )
            },
        },
        Migration {
            introduced: Version::new(1, 62, 0),
            description: "drop external-dns extension",
            apply: drop_external_dns_extension,
        },
        Migration {
            introduced: Version::new(1, 74, 0),
            description: "virtual cluster at least v1.22.17",
            apply: |state| raise_apiserver_version(state, &Version::new(1, 22, 17), &[]),
        },
        Migration {
            introduced: Version::new(1, 81, 0),
            description: "virtual cluster at least v1.24.17",
            apply: |state| raise_apiserver_version(state, &Version::new(1, 24, 17), &[]),
        },
        Migration {
            introduced: Version::new(1, 91, 0),
            description: "virtual cluster at least v1.25.16",
            apply: |state| raise_apiserver_version(state, &Version::new(1, 25, 16), &[]),
        },
    ]
}

/// Run every applicable migration in ascending order.
pub fn migrate(state: &mut VersionedState, target: &Version) -> Result<Migrated> {
    let stored = state.parsed_version();
    let mut migrated = Migrated::default();
    for migration in all() {
        if !migration.applies(stored.as_ref(), target) {
            continue;
        }
        info!(
            migration = %display_version(&migration.introduced),
            "Migrating state: {}", migration.description
        );
        let upgrades = (migration.apply)(state)?;
        migrated.apiserver_upgrades.extend(upgrades);
        migrated.applied.push(migration.introduced);
    }
    Ok(migrated)
}

fn get_path<'a>(values: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(values.get(*first)?, |value, key| value.get(key))
}

fn remove_path(values: &mut Map<String, Value>, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut current = values;
    for key in parents {
        current = current.get_mut(*key)?.as_object_mut()?;
    }
    current.remove(*last)
}

fn drop_weak_certificates(state: &mut VersionedState) -> Result<Vec<Version>> {
    const CERTIFICATES: &[&[&str]] = &[
        &["apiserver", "tls"],
        &["apiserver", "aggregator", "tls"],
        &["etcd", "tls"],
        &["gardener", "certs"],
    ];

    for path in CERTIFICATES {
        let Some(cert) = get_path(&state.values, path) else {
            continue;
        };
        let digest = cert
            .get("ca")
            .and_then(|ca| ca.get("messageDigest"))
            .and_then(Value::as_str);
        if digest != Some(REQUIRED_DIGEST) {
            info!(path = %path.join("."), "Dropping certificate with digest {:?}", digest);
            remove_path(&mut state.values, path);
        }
    }
    Ok(Vec::new())
}

fn drop_dns_records_feature_gate(state: &mut VersionedState) -> Result<Vec<Version>> {
    remove_path(&mut state.values, &["gardener", "featureGates", "UseDNSRecords"]);
    Ok(Vec::new())
}

fn drop_external_dns_extension(state: &mut VersionedState) -> Result<Vec<Version>> {
    remove_path(&mut state.values, &["gardener", "extensions", "external-dns"]);
    Ok(Vec::new())
}

/// Raise the virtual cluster to at least `minimum`. The apiserver cannot skip
/// minors, so the entries of `path` between the recorded and the new version
/// are returned for rollout.
fn raise_apiserver_version(
    state: &mut VersionedState,
    minimum: &Version,
    path: &[Version],
) -> Result<Vec<Version>> {
    let apiserver = state
        .values
        .entry("apiserver")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| LsiError::InvalidState("apiserver must be an object".to_string()))?;

    let current = match apiserver.get("version").and_then(Value::as_str) {
        Some(raw) => parse_version(raw)
            .map_err(|_| LsiError::InvalidState(format!("invalid apiserver version {raw}")))?,
        None => UNRECORDED_APISERVER_VERSION,
    };

    if core(&current) >= core(minimum) {
        return Ok(Vec::new());
    }
    info!(
        "Raising virtual cluster version from {} to {}",
        display_version(&current),
        display_version(minimum)
    );
    apiserver.insert(
        "version".to_string(),
        Value::String(display_version(minimum)),
    );

    let upgrades: Vec<Version> = path
        .iter()
        .filter(|v| core(v) > core(&current) && core(v) < core(minimum))
        .cloned()
        .collect();
    for version in &upgrades {
        info!("Adding virtual cluster update to {}", display_version(version));
    }
    Ok(upgrades)
}
