//! Utility modules and helper functions
//!
//! Shared helpers used across the engine: logging setup, HTTP plumbing,
//! file naming and URL validation.

pub mod file_utils;
pub mod logging;
pub mod network;
pub mod validation;

// Re-export commonly used utilities
pub use file_utils::*;
pub use logging::*;
pub use network::*;
pub use validation::*;
