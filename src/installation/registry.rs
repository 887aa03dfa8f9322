//! Maps a target version to the installation of its release line.

use anyhow::Result;
use semver::Version;

use super::Installation;
use crate::error::LsiError;
use crate::version::display_version;

/// Release lines with their own installation, ascending.
const RELEASE_LINES: &[(u64, u64)] = &[
    (1, 46),
    (1, 47),
    (1, 50),
    (1, 51),
    (1, 62),
    (1, 74),
    (1, 81),
    (1, 91),
];

/// Exclusive upper bound of the newest release line.
const SUPPORTED_UNTIL: (u64, u64) = (1, 92);

#[derive(Debug, Clone)]
struct Entry {
    from: Version,
    until: Version,
    installation: Installation,
}

/// Resolves target versions to installations. Each line covers
/// `[line, next line)`.
#[derive(Debug, Clone)]
pub struct InstallationRegistry {
    entries: Vec<Entry>,
}

impl Default for InstallationRegistry {
    fn default() -> Self {
        let bounds: Vec<Version> = RELEASE_LINES
            .iter()
            .chain(std::iter::once(&SUPPORTED_UNTIL))
            .map(|&(major, minor)| Version::new(major, minor, 0))
            .collect();

        let entries = bounds
            .windows(2)
            .map(|w| Entry {
                from: w[0].clone(),
                until: w[1].clone(),
                installation: Installation::new(w[0].clone()),
            })
            .collect();
        Self { entries }
    }
}

impl InstallationRegistry {
    /// Fails with [`LsiError::VersionNotFound`] outside every release line.
    pub fn get(&self, target: &Version) -> Result<&Installation> {
        let core = Version::new(target.major, target.minor, target.patch);
        self.entries
            .iter()
            .find(|e| e.from <= core && core < e.until)
            .map(|e| &e.installation)
            .ok_or_else(|| LsiError::VersionNotFound(display_version(target)).into())
    }

    pub fn lines(&self) -> impl Iterator<Item = &Version> {
        self.entries.iter().map(|e| &e.from)
    }
}
