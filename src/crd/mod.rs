//! Custom Resource Definitions for Astarte-K8s
//!
//! This module defines the Kubernetes CRD describing an Astarte instance.

mod astarte;
pub mod types;


pub use astarte::{Astarte, AstarteSpec, AstarteStatus, SpecValidationError};
pub use types::*;
