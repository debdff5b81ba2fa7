//! M3U playlist ingestion, stream reachability validation and playback failover

pub mod config;
pub mod errors;
pub mod ingestor;
pub mod models;
pub mod playback;
pub mod utils;
pub mod validator;

pub use config::Config;
pub use errors::{AppError, AppResult};
