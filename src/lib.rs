// TDSlicerHub Library
// This file enables the hub to be used as a library

pub mod auth;
pub mod config;
pub mod db;
pub mod domain;
pub mod errors;
pub mod naming;
pub mod orchestrator;
pub mod pages;
pub mod proxy;
pub mod reaper;

pub use errors::HubError;

// Re-export commonly used types
pub use anyhow::{Context, Result};
pub use tracing::{debug, error, info, warn};
pub use uuid::Uuid;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
