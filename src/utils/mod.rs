//! Utility functions shared by the index and the CLI.
//!
//! - [`app_data`] - Configuration file location and loading, index removal
//! - [`encoding`] - Variable-length integer and delta encoding
//! - [`progress`] - Progress bars, no-op without the `progress` feature

pub mod app_data;
pub mod encoding;
pub mod progress;

pub use app_data::*;
pub use encoding::*;
