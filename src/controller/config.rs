//! Operator-wide configuration
//!
//! Built once at process start and shared read-only by every reconcile.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::crd::PriorityTier;

use super::allocation::AllocationTable;
use super::components::ComponentKind;
use super::retry::RetryPolicy;

/// Requeue delay after an unparseable requested version
pub const INVALID_VERSION_REQUEUE: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Resource budget coefficients per kind
    pub allocation: AllocationTable,
    /// Priority tier used when a component does not pick one
    pub default_priorities: BTreeMap<ComponentKind, PriorityTier>,
    /// Bounded retry applied to status writes
    pub status_retry: RetryPolicy,
    /// Version written to `status.operatorVersion`
    pub operator_version: String,
    pub invalid_version_requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            allocation: AllocationTable::builtin(),
            default_priorities: builtin_priorities(),
            status_retry: RetryPolicy::default(),
            operator_version: env!("CARGO_PKG_VERSION").to_string(),
            invalid_version_requeue: INVALID_VERSION_REQUEUE,
        }
    }
}

impl OperatorConfig {
    pub fn default_priority(&self, kind: ComponentKind) -> PriorityTier {
        self.default_priorities
            .get(&kind)
            .copied()
            .unwrap_or(PriorityTier::Low)
    }
}

fn builtin_priorities() -> BTreeMap<ComponentKind, PriorityTier> {
    use ComponentKind::*;
    use PriorityTier::*;

    BTreeMap::from([
        (Housekeeping, High),
        (RealmManagement, High),
        (Pairing, High),
        (DataUpdaterPlant, High),
        (VerneMq, High),
        (Cfssl, High),
        (HousekeepingApi, Mid),
        (RealmManagementApi, Mid),
        (PairingApi, Mid),
        (AppengineApi, Mid),
        (TriggerEngine, Mid),
        (Flow, Low),
        (Dashboard, Low),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_a_default_priority() {
        let config = OperatorConfig::default();
        for kind in ComponentKind::ALL {
            assert!(config.default_priorities.contains_key(&kind), "{kind}");
        }
        assert_eq!(
            config.default_priority(ComponentKind::Dashboard),
            PriorityTier::Low
        );
        assert_eq!(
            config.default_priority(ComponentKind::AppengineApi),
            PriorityTier::Mid
        );
    }
}
