//! Astarte-K8s: Kubernetes operator for the Astarte IoT platform
//!
//! This crate provides a Kubernetes operator that installs, upgrades and
//! keeps healthy Astarte clusters described by `Astarte` custom resources.

pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
