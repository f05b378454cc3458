//! Proxy server lifecycle
//!
//! Binds the listener, accepts client connections, and runs each one
//! through the auth handshake and the proxy engine on its own task.
//! Shutdown cancels the process-wide token, stops accepting, and waits for
//! every in-flight client task to drain.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use pgscale_common::config::{Config, DatabaseConfig};
use pgscale_common::error::{PgScaleError, Result};

use crate::cluster::MemoryCluster;
use crate::dmaps::{Cluster, DMapRegistry};
use crate::pg_wire::auth;
use crate::pg_wire::messages::send_fatal_error;
use crate::pool::{BackendPool, BackendPoolConfig};
use crate::proxy::Proxy;

const TCP_KEEPALIVE_SECS: u64 = 60;

/// Everything a client session needs for its database: the config section
/// and the upstream pool.
struct DatabaseHandle {
    config: Arc<DatabaseConfig>,
    pool: BackendPool,
}

/// The PgScale proxy server.
pub struct ProxyServer {
    config: Arc<Config>,
    databases: Arc<HashMap<String, DatabaseHandle>>,
    registry: Arc<DMapRegistry>,
    token: CancellationToken,
    tracker: TaskTracker,
    local_addr: OnceLock<SocketAddr>,
    accept_counter: AtomicU64,
}

impl ProxyServer {
    /// Build a server with the in-process cluster store.
    pub fn new(config: Config) -> Self {
        Self::with_cluster(config, Arc::new(MemoryCluster))
    }

    /// Build a server backed by the given cache cluster.
    pub fn with_cluster(config: Config, cluster: Arc<dyn Cluster>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(DMapRegistry::new(cluster, config.dmap_plan()));

        let databases = config
            .postgresql
            .databases
            .iter()
            .map(|(name, db)| {
                let db = Arc::new(db.clone());
                let pool = BackendPool::new(BackendPoolConfig::from_database(&db));
                (name.clone(), DatabaseHandle { config: db, pool })
            })
            .collect();

        Self {
            config,
            databases: Arc::new(databases),
            registry,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: OnceLock::new(),
            accept_counter: AtomicU64::new(0),
        }
    }

    /// The bound address, available once `run` has bound the listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind and serve until shutdown. Accept errors after cancellation are
    /// swallowed; anything else is logged and the loop keeps accepting.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_addr, self.config.bind_port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        for handle in self.databases.values() {
            handle.pool.start_reaper(self.token.clone());
        }

        info!(addr = %local_addr, "PostgreSQL proxy is ready to accept connections");

        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (socket, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    if self.token.is_cancelled() {
                        break;
                    }
                    warn!(error = %e, "Error accepting connection");
                    continue;
                }
            };

            let conn_id = self.accept_counter.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(conn_id, peer = %peer_addr, "New client connection");
            configure_tcp_keepalive(&socket);

            let config = self.config.clone();
            let databases = self.databases.clone();
            let registry = self.registry.clone();
            let token = self.token.clone();

            self.tracker.spawn(async move {
                let result =
                    handle_connection(socket, config, databases, registry, token).await;
                match result {
                    Ok(()) => debug!(conn_id, "Client connection closed"),
                    Err(e) if e.is_disconnect() => debug!(conn_id, "Client disconnected"),
                    Err(PgScaleError::ShuttingDown) => {
                        debug!(conn_id, "Client connection cancelled by shutdown")
                    }
                    Err(e) => error!(conn_id, error = %e, "Error handling client connection"),
                }
            });
        }

        Ok(())
    }

    /// Stop accepting, cancel in-flight work, and wait for every client
    /// task to drain.
    pub async fn shutdown(&self) {
        info!("Shutting down, draining client connections");
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        for handle in self.databases.values() {
            handle.pool.close();
        }
        info!("Shutdown complete");
    }

    /// Number of connections accepted so far.
    pub fn accepted_connections(&self) -> u64 {
        self.accept_counter.load(Ordering::Relaxed)
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    config: Arc<Config>,
    databases: Arc<HashMap<String, DatabaseHandle>>,
    registry: Arc<DMapRegistry>,
    token: CancellationToken,
) -> Result<()> {
    let handshake_result = tokio::select! {
        _ = token.cancelled() => Err(PgScaleError::ShuttingDown),
        result = auth::handshake(&mut socket, &config) => result,
    };
    let session = match handshake_result {
        Ok(session) => session,
        Err(e) => {
            if matches!(e, PgScaleError::Protocol(_)) {
                let _ = send_fatal_error(&mut socket, e.sqlstate(), &e.to_string()).await;
            }
            return Err(e);
        }
    };

    let Some(handle) = databases.get(&session.database) else {
        let err = PgScaleError::UnknownDatabase(session.database.clone());
        send_fatal_error(&mut socket, err.sqlstate(), &err.to_string()).await?;
        return Err(err);
    };

    let proxy = Proxy::new(
        session,
        handle.config.clone(),
        registry,
        handle.pool.clone(),
        token,
    );
    proxy.run(socket).await
}

/// Faster dead-connection detection on accepted sockets.
fn configure_tcp_keepalive(stream: &TcpStream) {
    use socket2::SockRef;
    use std::time::Duration;

    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "Failed to set TCP_NODELAY");
    }

    let socket = SockRef::from(stream);
    if let Err(e) = socket.set_keepalive(true) {
        warn!(error = %e, "Failed to enable TCP keepalive");
        return;
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS / 2 + 1));

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "Failed to configure TCP keepalive timing");
    }
}
