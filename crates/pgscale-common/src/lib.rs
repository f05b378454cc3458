//! PgScale Common Library
//!
//! Shared configuration tree and error taxonomy for the PgScale proxy.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{Config, DMapParams, DatabaseConfig, PoolPolicy, TableCacheConfig};
pub use error::{PgScaleError, Result};
