//! Upgrade gate
//!
//! Decides whether a version transition may start. Two conditions must
//! hold: the cluster is stable enough (either the recorded or the freshly
//! computed health is green) and the transition is not a downgrade.

use semver::Version;

use crate::crd::ClusterHealth;
use crate::error::{Error, Result};

/// Literal version tracking the development branch
pub const SNAPSHOT: &str = "snapshot";

/// A parsed Astarte version
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AstarteVersion {
    /// Rolling development build, never compared
    Snapshot,
    Release(Version),
}

/// Parse a requested or recorded version.
///
/// Accepts full semver, "X.Y-snapshot" (normalized to X.Y.0) and the
/// literal "snapshot".
pub fn parse_version(version: &str) -> Result<AstarteVersion> {
    let trimmed = version.trim();
    if trimmed == SNAPSHOT {
        return Ok(AstarteVersion::Snapshot);
    }
    let normalized = match trimmed.strip_suffix("-snapshot") {
        Some(base) if base.split('.').count() == 2 => format!("{base}.0"),
        Some(base) => base.to_string(),
        None => trimmed.to_string(),
    };
    Version::parse(&normalized)
        .map(AstarteVersion::Release)
        .map_err(|e| Error::InvalidVersion {
            version: version.to_string(),
            reason: e.to_string(),
        })
}

/// What the reconciler has to do given recorded and requested versions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeNecessity {
    /// Nothing recorded yet
    FreshInstall,
    /// Recorded version is a snapshot; version checks do not apply
    Snapshot,
    UpToDate,
    Upgrade { from: String, to: String },
}

pub fn upgrade_necessity(recorded: &str, requested: &str) -> UpgradeNecessity {
    if recorded.is_empty() {
        UpgradeNecessity::FreshInstall
    } else if recorded == SNAPSHOT {
        UpgradeNecessity::Snapshot
    } else if recorded == requested {
        UpgradeNecessity::UpToDate
    } else {
        UpgradeNecessity::Upgrade {
            from: recorded.to_string(),
            to: requested.to_string(),
        }
    }
}

/// Health gate: allowed when either signal is green. An unrecorded health
/// does not count as green.
pub fn check_upgrade(recorded: Option<ClusterHealth>, computed: ClusterHealth) -> Result<()> {
    if recorded == Some(ClusterHealth::Green) || computed == ClusterHealth::Green {
        return Ok(());
    }
    Err(Error::UpgradeRefused(format!(
        "cluster health is {} (recorded {}), upgrades require a green cluster",
        computed,
        recorded.map_or_else(|| "unknown".to_string(), |h| h.to_string())
    )))
}

/// Version gate: downgrades are refused; snapshots always pass
pub fn check_version_transition(from: &str, to: &str) -> Result<()> {
    match (parse_version(from)?, parse_version(to)?) {
        (AstarteVersion::Release(from_v), AstarteVersion::Release(to_v)) if to_v < from_v => {
            Err(Error::UpgradeRefused(format!(
                "downgrade from {from} to {to} is not supported"
            )))
        }
        _ => Ok(()),
    }
}
