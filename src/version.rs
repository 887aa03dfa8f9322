//! Version parsing and installation path calculation.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::LsiError;

/// A known release of a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogVersion {
    #[serde(with = "version_serde")]
    pub version: Version,
    /// The release transforms persisted state and must never be skipped.
    #[serde(default)]
    pub has_migration: bool,
}

#[cfg(test)]
impl CatalogVersion {
    pub const fn new(version: Version) -> Self {
        Self {
            version,
            has_migration: false,
        }
    }

    pub const fn with_migration(version: Version) -> Self {
        Self {
            version,
            has_migration: true,
        }
    }
}

/// Parse a version string, accepting an optional leading `v`.
pub fn parse_version(version: &str) -> Result<Version> {
    let trimmed = version.trim();
    let raw = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(raw).map_err(|_| LsiError::InvalidVersion(version.to_string()).into())
}

/// Render a version as `vX.Y.Z`.
pub fn display_version(version: &Version) -> String {
    format!("v{version}")
}

/// True if `version` satisfies the tilde range `~base`
/// (same major and minor, not lower than `base`).
fn satisfies_tilde(version: &Version, base: &Version) -> bool {
    version.major == base.major && version.minor == base.minor && version >= base
}

/// Compute the ordered list of versions to install to get from `current` to
/// `target`.
///
/// Pure bugfix patches are skipped: only the latest patch of every minor in
/// range is kept, plus every patch flagged with a migration. When `current` is
/// unknown (first install) the target is installed directly.
pub fn versions_to_install(
    current: Option<&Version>,
    target: &Version,
    catalog: &[CatalogVersion],
) -> Vec<Version> {
    let Some(current) = current else {
        return vec![target.clone()];
    };

    let lower_bound = if satisfies_tilde(target, current) {
        current.clone()
    } else {
        Version::new(current.major, current.minor + 1, 0)
    };

    let in_range: Vec<&CatalogVersion> = catalog
        .iter()
        .filter(|v| v.version >= lower_bound && v.version <= *target)
        .collect();

    let mut latest_per_minor: BTreeMap<(u64, u64), &Version> = BTreeMap::new();
    for v in &in_range {
        let entry = latest_per_minor
            .entry((v.version.major, v.version.minor))
            .or_insert(&v.version);
        if v.version > **entry {
            *entry = &v.version;
        }
    }

    let selected: BTreeSet<Version> = in_range
        .iter()
        .filter(|v| {
            v.has_migration
                || latest_per_minor
                    .get(&(v.version.major, v.version.minor))
                    .is_some_and(|latest| **latest == v.version)
        })
        .map(|v| v.version.clone())
        .collect();

    selected.into_iter().collect()
}

/// Serde helpers for versions written as `vX.Y.Z` or `X.Y.Z`.
pub mod version_serde {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(version: &Version, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::display_version(version))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Version, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_version(&raw).map_err(serde::de::Error::custom)
    }
}
