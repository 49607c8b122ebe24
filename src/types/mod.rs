//! Core types for the messaging client.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (KernelId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for session, client, and manager

mod config;
mod errors;
mod ids;

pub use config::{ClientConfig, ManagerConfig, SessionConfig};
pub use errors::{Error, Result};
pub use ids::KernelId;
