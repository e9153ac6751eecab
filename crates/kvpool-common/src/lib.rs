//! kvpool Common - Shared types and utilities
//!
//! This crate provides the identifier newtypes, wire-facing metadata
//! structures, error definitions, and configuration used across all
//! kvpool components.

pub mod config;
pub mod error;
pub mod types;

pub use config::MasterConfig;
pub use error::{Error, Result};
pub use types::*;
