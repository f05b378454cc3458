//! PgScale server library
//!
//! A transparent PostgreSQL protocol proxy with upstream connection pooling
//! and a distributed, invalidation-free result cache for SELECT queries.
//!
//! - `pg_wire` - frame decoding, message builders, auth handshake
//! - `matcher` - SELECT recognition and cache routing
//! - `dmaps` - distributed map traits and registry
//! - `cluster` - in-process default cluster store
//! - `pool` - upstream connection pool driver
//! - `proxy` - per-client proxy engine
//! - `server` - listener and lifecycle

pub mod cluster;
pub mod dmaps;
pub mod matcher;
pub mod pg_wire;
pub mod pool;
pub mod proxy;
pub mod server;
pub mod telemetry;

pub use server::ProxyServer;
