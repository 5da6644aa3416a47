//! ClovaDrop core: configuration, records, tokens and the services that sit
//! in front of Postgres, Redis and the virus scanner.

pub mod access_log;
pub mod cache;
pub mod config;
pub mod error;
pub mod files;
pub mod models;
pub mod rate_limit;
pub mod tokens;
pub mod validation;
pub mod virus_scan;

pub use cache::Cache;
pub use config::{Config, UploadPolicy};
pub use error::CoreError;
