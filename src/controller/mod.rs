//! Controller module for Astarte reconciliation
//! This module contains the main controller loop, the reconciliation
//! pipeline and the builders for every object an Astarte instance owns.

pub mod allocation;
pub mod client;
mod component;
pub mod components;
pub mod config;
#[cfg(test)]
mod fake_client;
mod finalizers;
mod health;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod policy;
mod prerequisites;
mod reconciler;
pub mod resources;
pub mod retry;
mod status;
pub mod upgrade;
pub mod workloads;

pub use client::{ClusterClient, EventSeverity, KubeClusterClient};
pub use components::ComponentKind;
pub use config::OperatorConfig;
pub use finalizers::{finalize, ASTARTE_FINALIZER};
pub use health::{compute_health, compute_status};
pub use reconciler::{reconcile_astarte, run_controller, ControllerState};
