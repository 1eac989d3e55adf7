//! # nexus-common
//!
//! Shared wire models and configuration used by the Nexus voice client crates.
//! No session logic lives here, just primitives and contracts.

pub mod config;
pub mod models;
