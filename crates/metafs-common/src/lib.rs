//! MetaFS Common - Shared types and utilities
//!
//! This crate provides the types, error definitions, and configuration
//! structures shared across the MetaFS metadata server components.

pub mod config;
pub mod error;
pub mod types;

pub use config::JournalConfig;
pub use error::{Error, Result};
pub use types::*;
