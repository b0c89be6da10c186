//! # LFM Common Library
//!
//! Shared code for the lost & found matching services including:
//! - Error types
//! - TOML configuration loading and path resolution
//! - Logging initialization
//! - Log sanitizing for large descriptor payloads
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod logging;
pub mod sanitize;
pub mod time;

pub use error::{Error, Result};
