//! Configuration tree for the PgScale proxy
//!
//! The configuration is a tree: process-wide settings (bind address, auth
//! users, logging), then one entry per upstream database carrying the pool
//! policy, the reset query, and the per-schema/per-table cache knobs. After
//! loading, `sanitize()` back-fills the computed fields (`dbname` on each
//! database, `dmap_name` on each table) and validates credentials.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{PgScaleError, Result};

/// Environment variable that overrides the `--config` flag.
pub const ENV_CONFIG_FILE: &str = "PGSCALE_SERVER_CONFIG";

/// Default configuration file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "pgscale-server.yaml";

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the proxy listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Port the proxy listens on
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Client credential table
    pub auth: AuthConfig,
    /// Upstream databases
    pub postgresql: PostgresConfig,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    30212
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON-formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// Client credential table
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// user name -> credential
    pub users: HashMap<String, Credential>,
}

/// How a client user authenticates against the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// Accept without a password exchange
    Trust,
    /// Cleartext password comparison
    Password,
    /// Salted MD5 challenge
    Md5,
}

/// A single user credential
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub auth_type: AuthType,
    /// Cleartext password, required for `auth_type: password`
    pub password: Option<String>,
    /// `md5_hex(password || username)`, required for `auth_type: md5`
    pub hash: Option<String>,
}

/// Upstream database section
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub databases: HashMap<String, DatabaseConfig>,
}

/// Connection pool policy for a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolPolicy {
    /// One upstream connection held for the lifetime of the client session
    Session,
    /// An upstream connection acquired per forwarded request
    Statement,
}

/// Pool sizing and lifetime knobs, passed to the pool driver
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionPoolConfig {
    pub policy: PoolPolicy,
    #[serde(default = "default_min_conns")]
    pub min_conns: u32,
    #[serde(default = "default_max_conns")]
    pub max_conns: u32,
    pub max_conn_idle_secs: Option<u64>,
    pub max_conn_lifetime_secs: Option<u64>,
    pub health_check_period_secs: Option<u64>,
}

fn default_min_conns() -> u32 {
    1
}

fn default_max_conns() -> u32 {
    8
}

/// One upstream database: connection parameters, pool policy, and the
/// cache routing table.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Back-filled from the map key by `sanitize()`
    #[serde(skip)]
    pub dbname: String,
    /// Upstream connection parameters (host, port, user, password,
    /// application_name)
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub connection_pool: ConnectionPoolConfig,
    /// Log every candidate statement at info level
    #[serde(default)]
    pub log_statements: bool,
    /// Statement run on the upstream connection when it is released
    #[serde(default = "default_reset_query")]
    pub reset_query: String,
    /// Schema caches, matched in declaration order
    #[serde(default)]
    pub schemas: Vec<SchemaCacheConfig>,
}

fn default_reset_query() -> String {
    "DISCARD ALL;".to_string()
}

impl DatabaseConfig {
    /// Look up an upstream connection parameter.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Upstream host, defaulting to localhost.
    pub fn upstream_host(&self) -> &str {
        self.parameter("host").unwrap_or("127.0.0.1")
    }

    /// Upstream port, defaulting to 5432.
    pub fn upstream_port(&self) -> u16 {
        self.parameter("port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432)
    }
}

/// Eviction policy for a distributed map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    None,
    Lru,
}

/// Cache defaults for every table under a schema. Each table may override
/// the per-map knobs; `num_eviction_workers` and `storage_engine` apply to
/// the whole schema.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaCacheConfig {
    pub schema: String,
    pub num_eviction_workers: Option<u32>,
    pub max_idle_secs: Option<u64>,
    pub ttl_secs: Option<u64>,
    pub max_keys: Option<usize>,
    pub max_inuse_bytes: Option<usize>,
    pub lru_samples: Option<usize>,
    pub eviction_policy: Option<EvictionPolicy>,
    pub storage_engine: Option<String>,
    #[serde(default)]
    pub tables: Vec<TableCacheConfig>,
}

/// A cached table, optionally overriding the schema defaults
#[derive(Debug, Clone, Deserialize)]
pub struct TableCacheConfig {
    pub name: String,
    /// `"{dbname}.{schema}.{table}"`, back-filled by `sanitize()`
    #[serde(skip)]
    pub dmap_name: String,
    pub max_idle_secs: Option<u64>,
    pub ttl_secs: Option<u64>,
    pub max_keys: Option<usize>,
    pub max_inuse_bytes: Option<usize>,
    pub lru_samples: Option<usize>,
    pub eviction_policy: Option<EvictionPolicy>,
}

/// Creation parameters for one distributed map, resolved from the table
/// overrides with schema-level fallback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DMapParams {
    pub max_idle_secs: Option<u64>,
    pub ttl_secs: Option<u64>,
    pub max_keys: Option<usize>,
    pub max_inuse_bytes: Option<usize>,
    pub lru_samples: Option<usize>,
    pub eviction_policy: EvictionPolicy,
    pub storage_engine: Option<String>,
    pub num_eviction_workers: Option<u32>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PgScaleError::Config(format!(
                "file does not exist: {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| PgScaleError::Config(e.to_string()))?;

        let mut cfg: Config = settings
            .try_deserialize()
            .map_err(|e| PgScaleError::Config(e.to_string()))?;
        cfg.sanitize()?;
        Ok(cfg)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Yaml))
            .build()
            .map_err(|e| PgScaleError::Config(e.to_string()))?;

        let mut cfg: Config = settings
            .try_deserialize()
            .map_err(|e| PgScaleError::Config(e.to_string()))?;
        cfg.sanitize()?;
        Ok(cfg)
    }

    /// Back-fill computed fields and validate the credential table.
    fn sanitize(&mut self) -> Result<()> {
        for (user, cred) in &self.auth.users {
            match cred.auth_type {
                AuthType::Password if cred.password.is_none() => {
                    return Err(PgScaleError::Config(format!(
                        "user {user}: auth_type password requires a password field"
                    )));
                }
                AuthType::Md5 if cred.hash.is_none() => {
                    return Err(PgScaleError::Config(format!(
                        "user {user}: auth_type md5 requires a hash field"
                    )));
                }
                _ => {}
            }
        }

        for (dbname, db) in &mut self.postgresql.databases {
            db.dbname = dbname.clone();
            for schema in &mut db.schemas {
                for table in &mut schema.tables {
                    table.dmap_name = format!("{}.{}.{}", dbname, schema.schema, table.name);
                }
            }
        }

        Ok(())
    }

    /// Look up a database section by name.
    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.postgresql.databases.get(name)
    }

    /// Translate the cache knobs of every configured table into the
    /// per-map creation parameters, keyed by dmap name. Table values win;
    /// schema values fill the gaps; `num_eviction_workers` and
    /// `storage_engine` come only from the schema.
    pub fn dmap_plan(&self) -> HashMap<String, DMapParams> {
        let mut plan = HashMap::new();

        for db in self.postgresql.databases.values() {
            for schema in &db.schemas {
                for table in &schema.tables {
                    let params = DMapParams {
                        max_idle_secs: table.max_idle_secs.or(schema.max_idle_secs),
                        ttl_secs: table.ttl_secs.or(schema.ttl_secs),
                        max_keys: table.max_keys.or(schema.max_keys),
                        max_inuse_bytes: table.max_inuse_bytes.or(schema.max_inuse_bytes),
                        lru_samples: table.lru_samples.or(schema.lru_samples),
                        eviction_policy: table
                            .eviction_policy
                            .or(schema.eviction_policy)
                            .unwrap_or_default(),
                        storage_engine: schema.storage_engine.clone(),
                        num_eviction_workers: schema.num_eviction_workers,
                    };
                    plan.insert(table.dmap_name.clone(), params);
                }
            }
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
bind_addr: 127.0.0.1
bind_port: 30212
auth:
  users:
    alice:
      auth_type: trust
    bob:
      auth_type: md5
      hash: "0123456789abcdef0123456789abcdef"
postgresql:
  databases:
    appdb:
      parameters:
        host: 127.0.0.1
        port: "5433"
        user: app
      connection_pool:
        policy: session
        max_conns: 4
      log_statements: true
      schemas:
        - schema: public
          ttl_secs: 300
          max_keys: 1000
          lru_samples: 5
          eviction_policy: lru
          num_eviction_workers: 2
          tables:
            - name: users
              ttl_secs: 60
            - name: orders
"#;

    #[test]
    fn test_parse_and_sanitize() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.bind_port, 30212);

        let db = cfg.database("appdb").unwrap();
        assert_eq!(db.dbname, "appdb");
        assert_eq!(db.upstream_port(), 5433);
        assert_eq!(db.connection_pool.policy, PoolPolicy::Session);
        assert_eq!(db.connection_pool.max_conns, 4);
        assert_eq!(db.reset_query, "DISCARD ALL;");
        assert!(db.log_statements);

        let table = &db.schemas[0].tables[0];
        assert_eq!(table.dmap_name, "appdb.public.users");
    }

    #[test]
    fn test_dmap_plan_fallback() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        let plan = cfg.dmap_plan();

        // users overrides ttl, inherits the rest from the schema
        let users = &plan["appdb.public.users"];
        assert_eq!(users.ttl_secs, Some(60));
        assert_eq!(users.max_keys, Some(1000));
        assert_eq!(users.lru_samples, Some(5));
        assert_eq!(users.eviction_policy, EvictionPolicy::Lru);
        assert_eq!(users.num_eviction_workers, Some(2));

        // orders inherits everything
        let orders = &plan["appdb.public.orders"];
        assert_eq!(orders.ttl_secs, Some(300));
    }

    #[test]
    fn test_unknown_pool_policy_is_fatal() {
        let raw = SAMPLE.replace("policy: session", "policy: transaction");
        let err = Config::from_yaml(&raw).unwrap_err();
        assert!(matches!(err, PgScaleError::Config(_)));
    }

    #[test]
    fn test_md5_credential_requires_hash() {
        let raw = SAMPLE.replace(
            "hash: \"0123456789abcdef0123456789abcdef\"",
            "password: whoops",
        );
        let err = Config::from_yaml(&raw).unwrap_err();
        assert!(err.to_string().contains("requires a hash"));
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        let db = cfg.database("appdb").unwrap();
        assert_eq!(db.connection_pool.min_conns, 1);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }
}
