//! Centralized error handling for the M3U validator
//!
//! # Error Categories
//!
//! - **Source Errors**: playlist origin connectivity and payload problems
//! - **Media Load Errors**: per-stream probe and playback failure classes
//! - **Configuration Errors**: config file loading and rendering
//!
//! # Usage
//!
//! ```rust
//! use m3u_validator::errors::{AppError, AppResult};
//!
//! fn example_function() -> AppResult<String> {
//!     Ok("success".to_string())
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for Source Results
pub type SourceResult<T> = Result<T, SourceError>;
