//! gha-vm-executor library crate.

/// Core library modules and APIs: the VM lifecycle, control-socket client,
/// credential server, and the outbound collaborator interfaces.
pub mod core;

/// CLI argument parsing (only when the `cli` feature is enabled).
#[cfg(feature = "cli")]
pub mod cli;

pub mod app;

mod error;
mod utils;

pub use error::{Error, Result};
