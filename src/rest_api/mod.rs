//! REST API module for external integrations
//!
//! Provides a read-only HTTP API over the managed Astarte instances.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};
