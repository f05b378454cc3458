//! Upstream connection pool
//!
//! Owns the raw TCP connections to one upstream database. The driver
//! performs the backend-side startup itself (trust, cleartext, or MD5 from
//! the configured parameters); the proxy core only ever sees the socket as
//! an opaque byte stream. Release runs the configured reset query; a
//! connection whose reset fails is closed instead of re-pooled, and a
//! `PooledConn` dropped without release is never returned to the pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pgscale_common::config::DatabaseConfig;
use pgscale_common::error::{PgScaleError, Result};

use crate::pg_wire::auth::expected_md5_response;
use crate::pg_wire::messages::{build_password_message, build_query_message, build_startup_message};
use crate::pg_wire::reader::FrameReader;
use crate::pg_wire::READY_FOR_QUERY_IDENTIFIER;

const DEFAULT_HEALTH_CHECK_SECS: u64 = 30;

/// Pool driver settings, translated from a database config section.
#[derive(Debug, Clone)]
pub struct BackendPoolConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub application_name: String,
    pub min_conns: u32,
    pub max_conns: u32,
    pub max_conn_idle: Option<Duration>,
    pub max_conn_lifetime: Option<Duration>,
    pub health_check_period: Duration,
    pub reset_query: String,
}

impl BackendPoolConfig {
    pub fn from_database(db: &DatabaseConfig) -> Self {
        let pool = &db.connection_pool;
        Self {
            host: db.upstream_host().to_string(),
            port: db.upstream_port(),
            database: db.dbname.clone(),
            user: db.parameter("user").unwrap_or("postgres").to_string(),
            password: db.parameter("password").map(str::to_string),
            application_name: db
                .parameter("application_name")
                .unwrap_or("pgscale")
                .to_string(),
            min_conns: pool.min_conns,
            max_conns: pool.max_conns,
            max_conn_idle: pool.max_conn_idle_secs.map(Duration::from_secs),
            max_conn_lifetime: pool.max_conn_lifetime_secs.map(Duration::from_secs),
            health_check_period: Duration::from_secs(
                pool.health_check_period_secs
                    .unwrap_or(DEFAULT_HEALTH_CHECK_SECS),
            ),
            reset_query: db.reset_query.clone(),
        }
    }
}

struct BackendConn {
    stream: TcpStream,
    created_at: Instant,
    idle_since: Instant,
}

impl BackendConn {
    fn is_stale(&self, config: &BackendPoolConfig, now: Instant) -> bool {
        if let Some(lifetime) = config.max_conn_lifetime {
            if now.duration_since(self.created_at) >= lifetime {
                return true;
            }
        }
        if let Some(max_idle) = config.max_conn_idle {
            if now.duration_since(self.idle_since) >= max_idle {
                return true;
            }
        }
        false
    }
}

struct PoolInner {
    config: BackendPoolConfig,
    idle: Mutex<Vec<BackendConn>>,
    semaphore: Arc<Semaphore>,
}

/// A connection checked out of the pool. Holds its permit so the pool's
/// size bound covers live connections, not just idle ones.
pub struct PooledConn {
    conn: Option<BackendConn>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    /// The raw upstream socket, as an opaque bidirectional byte stream.
    pub fn socket(&mut self) -> Result<&mut TcpStream> {
        self.conn
            .as_mut()
            .map(|c| &mut c.stream)
            .ok_or_else(|| PgScaleError::Pool("connection already released".into()))
    }
}

/// Pool of upstream connections for one database.
#[derive(Clone)]
pub struct BackendPool {
    inner: Arc<PoolInner>,
}

impl BackendPool {
    pub fn new(config: BackendPoolConfig) -> Self {
        let max_conns = config.max_conns.max(1) as usize;
        Self {
            inner: Arc::new(PoolInner {
                config,
                idle: Mutex::new(Vec::new()),
                semaphore: Arc::new(Semaphore::new(max_conns)),
            }),
        }
    }

    /// Check a connection out of the pool, dialing the upstream if no
    /// reusable idle connection exists.
    pub async fn acquire(&self) -> Result<PooledConn> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PgScaleError::Pool("pool closed".into()))?;

        let now = Instant::now();
        let reusable = {
            let mut idle = self.inner.idle.lock();
            loop {
                match idle.pop() {
                    Some(conn) if conn.is_stale(&self.inner.config, now) => continue,
                    other => break other,
                }
            }
        };

        let conn = match reusable {
            Some(conn) => conn,
            None => connect(&self.inner.config).await?,
        };

        Ok(PooledConn {
            conn: Some(conn),
            _permit: permit,
        })
    }

    /// Return a connection to the pool. The configured reset query runs
    /// first; if the round trip fails the connection is closed instead.
    pub async fn release(&self, mut pooled: PooledConn) {
        let Some(mut conn) = pooled.conn.take() else {
            return;
        };

        match run_reset_query(&mut conn.stream, &self.inner.config.reset_query).await {
            Ok(()) => {
                conn.idle_since = Instant::now();
                self.inner.idle.lock().push(conn);
            }
            Err(e) => {
                warn!(error = %e, "Reset query failed, dropping upstream connection");
            }
        }
    }

    /// Periodically prune stale idle connections and top the pool back up
    /// to its minimum size.
    pub fn start_reaper(&self, token: CancellationToken) {
        let pool = self.clone();
        let period = pool.inner.config.health_check_period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let now = Instant::now();
                {
                    let mut idle = pool.inner.idle.lock();
                    idle.retain(|conn| !conn.is_stale(&pool.inner.config, now));
                }

                let deficit = {
                    let idle = pool.inner.idle.lock();
                    (pool.inner.config.min_conns as usize).saturating_sub(idle.len())
                };
                for _ in 0..deficit {
                    match connect(&pool.inner.config).await {
                        Ok(conn) => pool.inner.idle.lock().push(conn),
                        Err(e) => {
                            debug!(error = %e, "Pool top-up connect failed");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Drop every idle connection.
    pub fn close(&self) {
        self.inner.idle.lock().clear();
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }
}

/// Dial the upstream and run the backend-side startup handshake.
async fn connect(config: &BackendPoolConfig) -> Result<BackendConn> {
    let addr = format!("{}:{}", config.host, config.port);
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| PgScaleError::Pool(format!("connect {addr}: {e}")))?;
    stream.set_nodelay(true).ok();

    let startup = build_startup_message(&[
        ("user", &config.user),
        ("database", &config.database),
        ("application_name", &config.application_name),
    ]);
    stream.write_all(&startup).await?;
    stream.flush().await?;

    let mut reader = FrameReader::new(&mut stream);
    loop {
        let frame = reader.read_frame().await?;
        match frame.identifier {
            b'R' => {
                if frame.payload.len() < 4 {
                    return Err(PgScaleError::Pool("short authentication frame".into()));
                }
                let auth_type = u32::from_be_bytes([
                    frame.payload[0],
                    frame.payload[1],
                    frame.payload[2],
                    frame.payload[3],
                ]);
                match auth_type {
                    0 => {} // AuthenticationOk
                    3 => {
                        let password = config.password.as_deref().ok_or_else(|| {
                            PgScaleError::Pool("upstream requires a password".into())
                        })?;
                        let msg = build_password_message(password);
                        reader.get_mut().write_all(&msg).await?;
                        reader.get_mut().flush().await?;
                    }
                    5 => {
                        let password = config.password.as_deref().ok_or_else(|| {
                            PgScaleError::Pool("upstream requires a password".into())
                        })?;
                        if frame.payload.len() < 8 {
                            return Err(PgScaleError::Pool("short MD5 challenge".into()));
                        }
                        let salt: [u8; 4] = [
                            frame.payload[4],
                            frame.payload[5],
                            frame.payload[6],
                            frame.payload[7],
                        ];
                        let stored =
                            format!("{:x}", md5::compute(format!("{password}{}", config.user)));
                        let response = expected_md5_response(&stored, &salt);
                        let msg = build_password_message(&response);
                        reader.get_mut().write_all(&msg).await?;
                        reader.get_mut().flush().await?;
                    }
                    other => {
                        return Err(PgScaleError::Pool(format!(
                            "unsupported upstream authentication method: {other}"
                        )));
                    }
                }
            }
            b'E' => {
                return Err(PgScaleError::Pool(format!(
                    "upstream rejected startup: {}",
                    String::from_utf8_lossy(&frame.payload)
                )));
            }
            READY_FOR_QUERY_IDENTIFIER => break,
            // ParameterStatus, BackendKeyData, NoticeResponse
            _ => {}
        }
    }

    let now = Instant::now();
    debug!(addr = %addr, database = %config.database, "Upstream connection established");
    Ok(BackendConn {
        stream,
        created_at: now,
        idle_since: now,
    })
}

/// Run the reset statement and drain its response.
async fn run_reset_query(stream: &mut TcpStream, reset_query: &str) -> Result<()> {
    let msg = build_query_message(reset_query);
    stream.write_all(&msg).await?;
    stream.flush().await?;

    let mut reader = FrameReader::new(stream);
    loop {
        let frame = reader.read_frame().await?;
        if frame.identifier == READY_FOR_QUERY_IDENTIFIER {
            return Ok(());
        }
    }
}
