//! Per-client proxy engine
//!
//! One instance per authenticated client connection. The engine reads
//! client frames, decides per statement whether the result cache can answer
//! (short-circuiting the backend entirely on a hit), and otherwise forwards
//! the frames verbatim over a pooled upstream connection, streaming the
//! response back while tee-ing it into the pending cache entry. A response
//! is committed only when its terminating ReadyForQuery has been flushed to
//! the client.
//!
//! Pooling policy comes from the database config: `session` holds one
//! upstream connection for the client's lifetime, `statement` re-acquires
//! per forwarded request. Either way the connection is released on every
//! exit path.

use std::hash::Hasher;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

use pgscale_common::config::{DatabaseConfig, PoolPolicy, TableCacheConfig};
use pgscale_common::error::{PgScaleError, Result};

use crate::dmaps::{DMap, DMapRegistry};
use crate::matcher;
use crate::pg_wire::messages::send_fatal_error;
use crate::pg_wire::reader::{Frame, FrameReader};
use crate::pg_wire::Session;
use crate::pg_wire::{
    BIND_IDENTIFIER, PARSE_IDENTIFIER, QUERY_IDENTIFIER, READY_FOR_QUERY_IDENTIFIER,
    SYNC_IDENTIFIER, TERMINATE_IDENTIFIER,
};
use crate::pool::{BackendPool, PooledConn};

/// A backend round trip that began as a cache miss. Committed on the
/// terminating ReadyForQuery, discarded on any earlier failure.
struct PendingCache {
    dmap: Arc<dyn DMap>,
    key: String,
    accumulator: BytesMut,
}

/// Per-client proxy state machine.
pub struct Proxy {
    session: Session,
    database: Arc<DatabaseConfig>,
    registry: Arc<DMapRegistry>,
    pool: BackendPool,
    token: CancellationToken,
    /// Fingerprint scope prefix; empty means the cache is shared across
    /// users. Reserved for tenant-scoped cache partitioning.
    hash_prefix: Vec<u8>,
    pending_cache: Option<PendingCache>,
}

impl Proxy {
    pub fn new(
        session: Session,
        database: Arc<DatabaseConfig>,
        registry: Arc<DMapRegistry>,
        pool: BackendPool,
        token: CancellationToken,
    ) -> Self {
        Self {
            session,
            database,
            registry,
            pool,
            token,
            hash_prefix: Vec::new(),
            pending_cache: None,
        }
    }

    /// Drive the client connection until it terminates. `ClientGone` and
    /// shutdown are normal exits for the caller to downgrade.
    pub async fn run<S>(mut self, client: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(
            user = %self.session.user,
            database = %self.session.database,
            policy = ?self.database.connection_pool.policy,
            "Proxy started"
        );

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = FrameReader::new(read_half);

        match self.database.connection_pool.policy {
            PoolPolicy::Session => self.session_pooling(&mut reader, &mut write_half).await,
            PoolPolicy::Statement => self.statement_pooling(&mut reader, &mut write_half).await,
        }
    }

    /// One upstream connection for the whole client session.
    async fn session_pooling<R, W>(&mut self, r: &mut FrameReader<R>, w: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut server = self.acquire_or_report(w).await?;

        let result: Result<()> = async {
            let mut buf = BytesMut::new();
            loop {
                buf.clear();
                let done = self.read_from_client(r, w, &mut buf).await?;
                if done {
                    // Served from cache; no backend round trip.
                    continue;
                }
                self.request_to_server(&mut server, &buf, w).await?;
            }
        }
        .await;

        self.pool.release(server).await;
        result
    }

    /// Acquire per forwarded request, release right after ReadyForQuery.
    async fn statement_pooling<R, W>(&mut self, r: &mut FrameReader<R>, w: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::new();
        loop {
            buf.clear();
            let done = self.read_from_client(r, w, &mut buf).await?;
            if done {
                continue;
            }

            let mut server = self.acquire_or_report(w).await?;
            let result = self.request_to_server(&mut server, &buf, w).await;
            self.pool.release(server).await;
            result?;
        }
    }

    /// Forward one logical request and stream the response back.
    async fn request_to_server<W>(
        &mut self,
        server: &mut PooledConn,
        buf: &[u8],
        w: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let socket = server.socket()?;
        socket.write_all(buf).await?;
        socket.flush().await?;
        self.stream_backend_response(server, w).await
    }

    /// Read one client frame and decide what to do with it. Returns `true`
    /// when the request was served from cache; otherwise `buf` holds the
    /// frames to forward to the backend.
    async fn read_from_client<R, W>(
        &mut self,
        r: &mut FrameReader<R>,
        w: &mut W,
        buf: &mut BytesMut,
    ) -> Result<bool>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let frame = self.read_client_frame(r).await?;

        let served = match frame.identifier {
            PARSE_IDENTIFIER => self.handle_extended_query(r, &frame, w).await?,
            QUERY_IDENTIFIER => self.handle_simple_query(&frame, w).await?,
            TERMINATE_IDENTIFIER => return Err(PgScaleError::ClientGone),
            _ => false,
        };
        if served {
            return Ok(true);
        }

        buf.extend_from_slice(&frame.encode());

        // A Parse or Bind opens a logical statement that must be forwarded
        // as one unit, through the closing Sync.
        if frame.identifier == PARSE_IDENTIFIER || frame.identifier == BIND_IDENTIFIER {
            consume_until_sync(r, buf, &self.token).await?;
        }

        Ok(false)
    }

    async fn handle_simple_query<W>(&mut self, frame: &Frame, w: &mut W) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let query = simple_query_text(&frame.payload);
        if self.database.log_statements {
            info!(statement = %String::from_utf8_lossy(query), "Simple query statement");
        }

        let Some(table) = self.match_cached_table(query) else {
            return Ok(false);
        };
        let table = table.clone();

        match self.load_from_cache(&table, &frame.payload).await {
            Some(value) => {
                self.serve_from_cache(w, &value).await?;
                debug!(statement = %String::from_utf8_lossy(query), "Simple query served from cache");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn handle_extended_query<R, W>(
        &mut self,
        r: &mut FrameReader<R>,
        frame: &Frame,
        w: &mut W,
    ) -> Result<bool>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let query = parse_query_field(&frame.payload);
        if self.database.log_statements {
            info!(statement = %String::from_utf8_lossy(query), "Extended query statement");
        }

        let Some(table) = self.match_cached_table(query) else {
            return Ok(false);
        };
        let table = table.clone();

        match self.load_from_cache(&table, &frame.payload).await {
            Some(value) => {
                // Swallow the client's whole Parse..Sync burst before
                // replying; the cached bytes are the single coherent
                // response the client expects for it.
                loop {
                    let item = self.read_client_frame(r).await?;
                    if item.identifier == SYNC_IDENTIFIER {
                        break;
                    }
                }
                self.serve_from_cache(w, &value).await?;
                debug!(statement = %String::from_utf8_lossy(query), "Extended query served from cache");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run the SELECT fast path, the parser, and the routing table.
    fn match_cached_table(&self, query: &[u8]) -> Option<&TableCacheConfig> {
        let query = matcher::trim_nul_prefix(query);
        if !matcher::starts_with_select(query) {
            return None;
        }

        let sql = String::from_utf8_lossy(query);
        let hierarchy = match matcher::parse(&sql) {
            Ok(h) => h,
            Err(e) => {
                // Not necessarily invalid SQL; the backend has the final
                // say, so degrade to pass-through.
                debug!(error = %e, "Statement did not parse, bypassing cache");
                return None;
            }
        };

        hierarchy.match_table(&self.database)
    }

    /// Probe the table's map. A hit returns the stored response; a missing
    /// key arms `pending_cache` so the backend response gets captured. Any
    /// cache failure degrades to pass-through without population.
    async fn load_from_cache(
        &mut self,
        table: &TableCacheConfig,
        raw_payload: &[u8],
    ) -> Option<Bytes> {
        let dmap = match self.registry.get_or_create(&table.dmap_name).await {
            Ok(dmap) => dmap,
            Err(e) => {
                warn!(error = %e, dmap = %table.dmap_name, "Failed to get or create dmap");
                return None;
            }
        };

        let key = self.fingerprint(raw_payload).to_string();
        match dmap.get(&key).await {
            Ok(value) => Some(value),
            Err(PgScaleError::KeyNotFound) => {
                self.pending_cache = Some(PendingCache {
                    dmap,
                    key,
                    accumulator: BytesMut::new(),
                });
                None
            }
            Err(e) => {
                debug!(error = %e, dmap = %table.dmap_name, "Cache read failed");
                None
            }
        }
    }

    /// Stream backend frames to the client until ReadyForQuery, tee-ing
    /// into the pending accumulator. The commit happens strictly after the
    /// terminating frame has been flushed to the client.
    async fn stream_backend_response<W>(&mut self, server: &mut PooledConn, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.stream_frames(server, w).await;
        if result.is_err() {
            // No partial commits.
            self.pending_cache = None;
        }
        result
    }

    async fn stream_frames<W>(&mut self, server: &mut PooledConn, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let token = self.token.clone();
        let socket = server.socket()?;
        let mut reader = FrameReader::new(socket);

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => return Err(PgScaleError::ShuttingDown),
                frame = reader.read_frame() => frame.map_err(|e| match e {
                    // EOF from the backend mid-response is a hard failure.
                    PgScaleError::ClientGone => {
                        PgScaleError::Pool("backend connection closed mid-response".into())
                    }
                    other => other,
                })?,
            };

            let encoded = frame.encode();
            if let Some(pending) = self.pending_cache.as_mut() {
                pending.accumulator.extend_from_slice(&encoded);
            }

            w.write_all(&encoded).await?;

            if frame.identifier == READY_FOR_QUERY_IDENTIFIER {
                w.flush().await?;
                if let Some(pending) = self.pending_cache.take() {
                    let value = pending.accumulator.freeze();
                    if let Err(e) = pending.dmap.put(&pending.key, value).await {
                        warn!(error = %e, "Failed to cache query response");
                    }
                }
                return Ok(());
            }
        }
    }

    async fn serve_from_cache<W>(&self, w: &mut W, value: &Bytes) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(value).await?;
        w.flush().await?;
        debug!(bytes = value.len(), "Served response from cache");
        Ok(())
    }

    async fn read_client_frame<R>(&self, r: &mut FrameReader<R>) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        tokio::select! {
            _ = self.token.cancelled() => Err(PgScaleError::ShuttingDown),
            frame = r.read_frame() => frame,
        }
    }

    async fn acquire(&self) -> Result<PooledConn> {
        tokio::select! {
            _ = self.token.cancelled() => Err(PgScaleError::ShuttingDown),
            conn = self.pool.acquire() => conn,
        }
    }

    /// Acquire an upstream connection; a pool failure is fatal for this
    /// client and reported on the wire before the connection closes.
    async fn acquire_or_report<W>(&self, w: &mut W) -> Result<PooledConn>
    where
        W: AsyncWrite + Unpin,
    {
        match self.acquire().await {
            Ok(conn) => Ok(conn),
            Err(e @ PgScaleError::Pool(_)) => {
                let _ = send_fatal_error(w, e.sqlstate(), &e.to_string()).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn fingerprint(&self, payload: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&self.hash_prefix);
        hasher.write(payload);
        hasher.finish()
    }
}

/// Append frames to `buf` until (and including) the Sync that closes the
/// logical statement.
async fn consume_until_sync<R>(
    r: &mut FrameReader<R>,
    buf: &mut BytesMut,
    token: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let item = tokio::select! {
            _ = token.cancelled() => return Err(PgScaleError::ShuttingDown),
            frame = r.read_frame() => frame?,
        };

        buf.extend_from_slice(&item.encode());

        if item.identifier == SYNC_IDENTIFIER {
            return Ok(());
        }
    }
}

/// The SQL text of a simple Query payload, up to its NUL terminator.
fn simple_query_text(payload: &[u8]) -> &[u8] {
    match payload.iter().position(|&b| b == 0) {
        Some(end) => &payload[..end],
        None => payload,
    }
}

/// The query field of a Parse payload: after the statement name, up to the
/// next NUL terminator.
fn parse_query_field(payload: &[u8]) -> &[u8] {
    let Some(name_end) = payload.iter().position(|&b| b == 0) else {
        return payload;
    };
    let rest = &payload[name_end + 1..];
    match rest.iter().position(|&b| b == 0) {
        Some(end) => &rest[..end],
        None => rest,
    }
}
