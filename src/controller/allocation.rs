//! Resource allocation calculator
//!
//! Splits the cluster-wide resource budget among the deployed components.
//! Each kind owns a fixed share of the budget; the shares of disabled kinds
//! are pooled and handed out equally to the enabled ones, so the shares of
//! the enabled set always add up to the whole budget.
//!
//! Everything here is pure: no I/O, deterministic for a given spec snapshot.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::crd::AstarteSpec;
use crate::error::{Error, Result};

use super::components::ComponentKind;

/// CPU requests below this collapse to zero (fully burstable)
pub const MIN_CPU_REQUEST_MILLIS: i64 = 150;
/// Memory requests below this are raised to it (128M)
pub const MIN_MEMORY_REQUEST_BYTES: i64 = 128_000_000;
/// CPU limits below this are raised to it
pub const MIN_CPU_LIMIT_MILLIS: i64 = 300;

/// Share of the budget assigned to one kind
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AllocationCoefficients {
    pub cpu: f64,
    pub memory: f64,
}

impl AllocationCoefficients {
    pub const fn new(cpu: f64, memory: f64) -> Self {
        Self { cpu, memory }
    }
}

/// Per-kind default shares; each column sums to 1.0
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationTable {
    coefficients: BTreeMap<ComponentKind, AllocationCoefficients>,
}

impl AllocationTable {
    pub fn new(coefficients: BTreeMap<ComponentKind, AllocationCoefficients>) -> Self {
        Self { coefficients }
    }

    /// Built-in shares
    pub fn builtin() -> Self {
        use ComponentKind::*;

        Self::new(BTreeMap::from([
            (Housekeeping, AllocationCoefficients::new(0.03, 0.03)),
            (HousekeepingApi, AllocationCoefficients::new(0.03, 0.03)),
            (RealmManagement, AllocationCoefficients::new(0.03, 0.03)),
            (RealmManagementApi, AllocationCoefficients::new(0.03, 0.03)),
            (Pairing, AllocationCoefficients::new(0.04, 0.04)),
            (PairingApi, AllocationCoefficients::new(0.08, 0.08)),
            (DataUpdaterPlant, AllocationCoefficients::new(0.22, 0.20)),
            (TriggerEngine, AllocationCoefficients::new(0.10, 0.10)),
            (AppengineApi, AllocationCoefficients::new(0.15, 0.15)),
            (Flow, AllocationCoefficients::new(0.04, 0.04)),
            (Dashboard, AllocationCoefficients::new(0.02, 0.02)),
            (VerneMq, AllocationCoefficients::new(0.20, 0.22)),
            (Cfssl, AllocationCoefficients::new(0.03, 0.03)),
        ]))
    }

    fn get(&self, kind: ComponentKind) -> AllocationCoefficients {
        self.coefficients
            .get(&kind)
            .copied()
            .unwrap_or(AllocationCoefficients::new(0.0, 0.0))
    }

    /// Shares after moving the disabled kinds' shares to the enabled ones.
    ///
    /// The result only depends on the enabled set, not on iteration order.
    pub fn effective(
        &self,
        enabled: &BTreeSet<ComponentKind>,
    ) -> BTreeMap<ComponentKind, AllocationCoefficients> {
        if enabled.is_empty() {
            return BTreeMap::new();
        }

        let (mut leftover_cpu, mut leftover_memory) = (0.0, 0.0);
        for kind in ComponentKind::ALL {
            if !enabled.contains(&kind) {
                let c = self.get(kind);
                leftover_cpu += c.cpu;
                leftover_memory += c.memory;
            }
        }

        let count = enabled.len() as f64;
        enabled
            .iter()
            .map(|kind| {
                let c = self.get(*kind);
                (
                    *kind,
                    AllocationCoefficients::new(
                        c.cpu + leftover_cpu / count,
                        c.memory + leftover_memory / count,
                    ),
                )
            })
            .collect()
    }
}

/// Kinds the current spec deploys
pub fn enabled_kinds(spec: &AstarteSpec) -> BTreeSet<ComponentKind> {
    ComponentKind::ALL
        .into_iter()
        .filter(|kind| kind.is_deployed(spec))
        .collect()
}

/// Resources for one component.
///
/// An explicit per-component override is returned verbatim. Without a
/// cluster-wide budget the result is `None` (unconstrained).
pub fn allocate(
    table: &AllocationTable,
    spec: &AstarteSpec,
    kind: ComponentKind,
) -> Result<Option<ResourceRequirements>> {
    if let Some(explicit) = &kind.spec(spec).resources {
        return Ok(Some(explicit.clone()));
    }
    let Some(budget) = &spec.components.resources else {
        return Ok(None);
    };

    let shares = table.effective(&enabled_kinds(spec));
    let share = shares
        .get(&kind)
        .copied()
        .unwrap_or(AllocationCoefficients::new(0.0, 0.0));

    let budget_cpu_limit = budget_value(budget.limits.as_ref(), "cpu", parse_cpu_millis)?;
    let budget_mem_limit = budget_value(budget.limits.as_ref(), "memory", parse_memory_bytes)?;
    let budget_cpu_request = budget_value(budget.requests.as_ref(), "cpu", parse_cpu_millis)?;
    let budget_mem_request =
        budget_value(budget.requests.as_ref(), "memory", parse_memory_bytes)?;

    let scale = |value: i64, coefficient: f64| (value as f64 * coefficient).round() as i64;

    let cpu_request = budget_cpu_request.map(|v| {
        let scaled = scale(v, share.cpu);
        if scaled < MIN_CPU_REQUEST_MILLIS {
            0
        } else {
            scaled
        }
    });
    let mem_request = budget_mem_request.map(|v| scale(v, share.memory).max(MIN_MEMORY_REQUEST_BYTES));

    let cpu_limit = budget_cpu_limit.map(|v| {
        scale(v, share.cpu)
            .max(cpu_request.unwrap_or(0))
            .max(MIN_CPU_LIMIT_MILLIS)
    });
    let mem_limit = budget_mem_limit.map(|v| scale(v, share.memory).max(mem_request.unwrap_or(0)));

    let mut limits = BTreeMap::new();
    let mut requests = BTreeMap::new();
    if let Some(v) = cpu_limit {
        limits.insert("cpu".to_string(), Quantity(format!("{v}m")));
    }
    if let Some(v) = mem_limit {
        limits.insert("memory".to_string(), Quantity(v.to_string()));
    }
    if let Some(v) = cpu_request {
        requests.insert("cpu".to_string(), Quantity(format!("{v}m")));
    }
    if let Some(v) = mem_request {
        requests.insert("memory".to_string(), Quantity(v.to_string()));
    }

    Ok(Some(ResourceRequirements {
        limits: (!limits.is_empty()).then_some(limits),
        requests: (!requests.is_empty()).then_some(requests),
        ..Default::default()
    }))
}

fn budget_value(
    values: Option<&BTreeMap<String, Quantity>>,
    resource: &str,
    parse: fn(&str) -> Option<i64>,
) -> Result<Option<i64>> {
    match values.and_then(|v| v.get(resource)) {
        None => Ok(None),
        Some(q) => parse(&q.0).map(Some).ok_or_else(|| {
            Error::ValidationError(format!(
                "cannot parse {resource} quantity {:?} in spec.components.resources",
                q.0
            ))
        }),
    }
}

fn split_suffix(s: &str) -> (&str, &str) {
    let idx = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    s.split_at(idx)
}

/// Decimal exponent form of a quantity suffix ("e3", "E-2")
fn exponent_multiplier(suffix: &str) -> Option<f64> {
    let exponent = suffix.strip_prefix(['e', 'E'])?;
    let exponent: i32 = exponent.parse().ok()?;
    Some(10f64.powi(exponent))
}

/// Parse a CPU quantity ("2", "0.5", "250m", "1e3") into milli-CPU
pub fn parse_cpu_millis(s: &str) -> Option<i64> {
    let (number, suffix) = split_suffix(s.trim());
    let value: f64 = number.parse().ok()?;
    let millis = match suffix {
        "" => value * 1000.0,
        "m" => value,
        "k" => value * 1_000_000.0,
        _ => value * 1000.0 * exponent_multiplier(suffix)?,
    };
    (millis >= 0.0).then(|| millis.round() as i64)
}

/// Parse a memory quantity ("512Mi", "1G", "1073741824") into bytes
pub fn parse_memory_bytes(s: &str) -> Option<i64> {
    let (number, suffix) = split_suffix(s.trim());
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        "m" => 1e-3,
        _ => exponent_multiplier(suffix)?,
    };
    let bytes = value * multiplier;
    (bytes >= 0.0).then(|| bytes.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AstarteApiSpec, AstarteVerneMqSpec};

    const EPSILON: f64 = 1e-9;

    fn spec_with_budget(cpu: &str, memory: &str) -> AstarteSpec {
        let quantities = BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ]);
        let mut spec: AstarteSpec = serde_json::from_value(serde_json::json!({
            "version": "1.1.0",
            "api": {"host": "api.example.com"},
            "vernemq": {"host": "broker.example.com"}
        }))
        .unwrap();
        spec.components.resources = Some(ResourceRequirements {
            limits: Some(quantities.clone()),
            requests: Some(quantities),
            ..Default::default()
        });
        spec
    }

    fn cpu(req: &ResourceRequirements, which: &str) -> String {
        let map = if which == "limits" {
            req.limits.as_ref()
        } else {
            req.requests.as_ref()
        };
        map.unwrap().get("cpu").unwrap().0.clone()
    }

    fn memory(req: &ResourceRequirements, which: &str) -> String {
        let map = if which == "limits" {
            req.limits.as_ref()
        } else {
            req.requests.as_ref()
        };
        map.unwrap().get("memory").unwrap().0.clone()
    }

    #[test]
    fn test_builtin_table_sums_to_one() {
        let all: BTreeSet<_> = ComponentKind::ALL.into_iter().collect();
        let shares = AllocationTable::builtin().effective(&all);
        let cpu: f64 = shares.values().map(|c| c.cpu).sum();
        let memory: f64 = shares.values().map(|c| c.memory).sum();
        assert!((cpu - 1.0).abs() < EPSILON, "cpu sums to {cpu}");
        assert!((memory - 1.0).abs() < EPSILON, "memory sums to {memory}");
    }

    #[test]
    fn test_conservation_for_every_enabled_subset() {
        let table = AllocationTable::builtin();
        let kinds = ComponentKind::ALL;
        for mask in 1u32..(1 << kinds.len()) {
            let enabled: BTreeSet<_> = kinds
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, k)| *k)
                .collect();
            let shares = table.effective(&enabled);
            assert_eq!(shares.len(), enabled.len());
            let cpu: f64 = shares.values().map(|c| c.cpu).sum();
            let memory: f64 = shares.values().map(|c| c.memory).sum();
            assert!((cpu - 1.0).abs() < EPSILON, "mask {mask:#b}: cpu {cpu}");
            assert!((memory - 1.0).abs() < EPSILON, "mask {mask:#b}: memory {memory}");
        }
    }

    #[test]
    fn test_leftover_is_split_equally() {
        let table = AllocationTable::builtin();
        let enabled: BTreeSet<_> = [ComponentKind::Housekeeping, ComponentKind::Dashboard]
            .into_iter()
            .collect();
        let shares = table.effective(&enabled);
        let hk = shares[&ComponentKind::Housekeeping];
        let dash = shares[&ComponentKind::Dashboard];
        // 0.03 + (1 - 0.05) / 2 and 0.02 + (1 - 0.05) / 2
        assert!((hk.cpu - 0.505).abs() < EPSILON);
        assert!((dash.cpu - 0.495).abs() < EPSILON);
    }

    #[test]
    fn test_explicit_override_is_returned_verbatim() {
        let mut spec = spec_with_budget("10", "10G");
        let explicit = ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity("1m".to_string()),
            )])),
            ..Default::default()
        };
        spec.components.pairing.resources = Some(explicit.clone());
        let out = allocate(&AllocationTable::builtin(), &spec, ComponentKind::Pairing).unwrap();
        assert_eq!(out, Some(explicit));
    }

    #[test]
    fn test_no_budget_means_unconstrained() {
        let spec: AstarteSpec = AstarteSpec {
            version: "1.1.0".to_string(),
            manual_maintenance_mode: false,
            features: Default::default(),
            api: AstarteApiSpec {
                host: "api.example.com".to_string(),
                ssl: None,
            },
            rabbitmq: Default::default(),
            cassandra: Default::default(),
            vernemq: AstarteVerneMqSpec {
                host: "broker.example.com".to_string(),
                ..Default::default()
            },
            cfssl: Default::default(),
            components: Default::default(),
            deployment_strategy: None,
            image_pull_policy: None,
            distribution_channel: None,
        };
        let out = allocate(&AllocationTable::builtin(), &spec, ComponentKind::Housekeeping).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_small_cpu_request_collapses_to_zero() {
        // Flow is off by default; dashboard gets 0.02 + leftover / 12 of 2 CPUs
        let spec = spec_with_budget("2", "64G");
        let out = allocate(&AllocationTable::builtin(), &spec, ComponentKind::Dashboard)
            .unwrap()
            .unwrap();
        assert_eq!(cpu(&out, "requests"), "0m");
        // Limit floor still applies
        assert_eq!(cpu(&out, "limits"), "300m");
    }

    #[test]
    fn test_small_memory_request_is_raised_to_128m() {
        let spec = spec_with_budget("100", "1G");
        let out = allocate(&AllocationTable::builtin(), &spec, ComponentKind::Dashboard)
            .unwrap()
            .unwrap();
        assert_eq!(memory(&out, "requests"), "128000000");
        assert_eq!(memory(&out, "limits"), "128000000");
    }

    #[test]
    fn test_large_budget_scales_linearly() {
        let spec = spec_with_budget("100", "100G");
        let out = allocate(
            &AllocationTable::builtin(),
            &spec,
            ComponentKind::DataUpdaterPlant,
        )
        .unwrap()
        .unwrap();
        // 0.22 + 0.04 / 12 of 100 CPUs
        let expected = ((0.22 + 0.04 / 12.0) * 100_000.0_f64).round() as i64;
        assert_eq!(cpu(&out, "requests"), format!("{expected}m"));
        assert_eq!(cpu(&out, "limits"), format!("{expected}m"));
    }

    #[test]
    fn test_disabled_component_still_gets_no_share() {
        let mut spec = spec_with_budget("10", "10G");
        spec.components.dashboard.deploy = Some(false);
        assert!(!enabled_kinds(&spec).contains(&ComponentKind::Dashboard));
        assert!(enabled_kinds(&spec).contains(&ComponentKind::Cfssl));
    }

    #[test]
    fn test_unparseable_budget_is_a_validation_error() {
        let spec = spec_with_budget("lots", "10G");
        let err = allocate(&AllocationTable::builtin(), &spec, ComponentKind::Pairing).unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(parse_cpu_millis("2"), Some(2000));
        assert_eq!(parse_cpu_millis("0.5"), Some(500));
        assert_eq!(parse_cpu_millis("250m"), Some(250));
        assert_eq!(parse_cpu_millis("abc"), None);
        assert_eq!(parse_memory_bytes("128M"), Some(128_000_000));
        assert_eq!(parse_memory_bytes("1Gi"), Some(1_073_741_824));
        assert_eq!(parse_memory_bytes("512"), Some(512));
        assert_eq!(parse_memory_bytes("1Zi"), None);
    }

    #[test]
    fn test_exponent_quantities() {
        assert_eq!(parse_cpu_millis("1e3"), Some(1_000_000));
        assert_eq!(parse_cpu_millis("5E-1"), Some(500));
        assert_eq!(parse_memory_bytes("1e9"), Some(1_000_000_000));
        assert_eq!(parse_memory_bytes("1.5E3"), Some(1500));
        // A bare E is still the exa suffix
        assert_eq!(parse_memory_bytes("1E"), Some(1_000_000_000_000_000_000));
        assert_eq!(parse_memory_bytes("1ex"), None);
    }

    #[test]
    fn test_exponent_budget_is_accepted() {
        let spec = spec_with_budget("1e1", "1e10");
        let out = allocate(&AllocationTable::builtin(), &spec, ComponentKind::Pairing).unwrap();
        assert!(out.is_some());
    }
}
