//! Test support: a scripted mock PostgreSQL backend and a raw wire client.
//!
//! The mock backend speaks just enough of the protocol for the pool driver
//! to connect through it: it accepts the startup message, answers simple
//! queries with a canned result set, answers extended-protocol bursts after
//! the closing Sync, and acknowledges reset queries. Each response embeds
//! the backend's round-trip counter so a replayed (cached) response is
//! distinguishable from a fresh one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const READY_FOR_QUERY: [u8; 6] = [b'Z', 0, 0, 0, 5, b'I'];

/// Round-trip counters shared with the test body.
#[derive(Default)]
pub struct BackendCounters {
    /// Simple queries answered (reset queries excluded)
    pub queries: AtomicUsize,
    /// Extended-protocol bursts answered
    pub extended: AtomicUsize,
    /// Reset queries acknowledged
    pub resets: AtomicUsize,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub counters: Arc<BackendCounters>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counters = Arc::new(BackendCounters::default());

        let accept_counters = counters.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let counters = accept_counters.clone();
                tokio::spawn(async move {
                    let _ = serve_conn(socket, counters).await;
                });
            }
        });

        Self { addr, counters }
    }

    pub fn queries(&self) -> usize {
        self.counters.queries.load(Ordering::SeqCst)
    }

    pub fn extended(&self) -> usize {
        self.counters.extended.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.counters.resets.load(Ordering::SeqCst)
    }
}

async fn serve_conn(mut socket: TcpStream, counters: Arc<BackendCounters>) -> std::io::Result<()> {
    // Backend-side startup: length-prefixed startup message, then auth ok.
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut startup = vec![0u8; len - 4];
    socket.read_exact(&mut startup).await?;

    socket.write_all(&[b'R', 0, 0, 0, 8, 0, 0, 0, 0]).await?;
    socket.write_all(&READY_FOR_QUERY).await?;
    socket.flush().await?;

    loop {
        let mut id = [0u8; 1];
        if socket.read_exact(&mut id).await.is_err() {
            return Ok(());
        }
        socket.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len - 4];
        socket.read_exact(&mut payload).await?;

        match id[0] {
            b'Q' => {
                let sql = String::from_utf8_lossy(&payload);
                let sql = sql.trim_end_matches('\0').trim().to_uppercase();
                if sql.starts_with("DISCARD") || sql.starts_with("RESET") {
                    counters.resets.fetch_add(1, Ordering::SeqCst);
                    let mut response = command_complete("DISCARD ALL");
                    response.extend_from_slice(&READY_FOR_QUERY);
                    socket.write_all(&response).await?;
                } else {
                    let trip = counters.queries.fetch_add(1, Ordering::SeqCst) + 1;
                    let tag = if sql.starts_with("UPDATE") {
                        "UPDATE 1".to_string()
                    } else {
                        "SELECT 1".to_string()
                    };
                    let mut response = row_description(&["id"]);
                    response.extend_from_slice(&data_row(&[&trip.to_string()]));
                    response.extend_from_slice(&command_complete(&tag));
                    response.extend_from_slice(&READY_FOR_QUERY);
                    socket.write_all(&response).await?;
                }
                socket.flush().await?;
            }
            b'S' => {
                // End of an extended-protocol burst
                let trip = counters.extended.fetch_add(1, Ordering::SeqCst) + 1;
                let mut response = vec![b'1', 0, 0, 0, 4]; // ParseComplete
                response.extend_from_slice(&[b'2', 0, 0, 0, 4]); // BindComplete
                response.extend_from_slice(&row_description(&["id"]));
                response.extend_from_slice(&data_row(&[&trip.to_string()]));
                response.extend_from_slice(&command_complete("SELECT 1"));
                response.extend_from_slice(&READY_FOR_QUERY);
                socket.write_all(&response).await?;
                socket.flush().await?;
            }
            b'X' => return Ok(()),
            // Parse, Bind, Describe, Execute: buffered until Sync
            _ => {}
        }
    }
}

pub fn frame(identifier: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![identifier];
    buf.extend_from_slice(&((4 + payload.len()) as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn row_description(columns: &[&str]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(columns.len() as i16).to_be_bytes());
    for name in columns {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(&0u32.to_be_bytes()); // table OID
        body.extend_from_slice(&0i16.to_be_bytes()); // column attr
        body.extend_from_slice(&25u32.to_be_bytes()); // type OID (text)
        body.extend_from_slice(&(-1i16).to_be_bytes()); // type size
        body.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        body.extend_from_slice(&0i16.to_be_bytes()); // format code
    }
    frame(b'T', &body)
}

pub fn data_row(values: &[&str]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(values.len() as i16).to_be_bytes());
    for value in values {
        body.extend_from_slice(&(value.len() as i32).to_be_bytes());
        body.extend_from_slice(value.as_bytes());
    }
    frame(b'D', &body)
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = tag.as_bytes().to_vec();
    body.push(0);
    frame(b'C', &body)
}

/// Raw wire-protocol client for driving the proxy in tests.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self { stream }
    }

    pub async fn send_startup(&mut self, user: &str, database: &str) {
        let mut body = 196608u32.to_be_bytes().to_vec();
        for (key, value) in [("user", user), ("database", database)] {
            body.extend_from_slice(key.as_bytes());
            body.push(0);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        let mut msg = ((body.len() + 4) as u32).to_be_bytes().to_vec();
        msg.extend_from_slice(&body);
        self.stream.write_all(&msg).await.unwrap();
    }

    pub async fn send_ssl_request(&mut self) -> u8 {
        let mut msg = 8u32.to_be_bytes().to_vec();
        msg.extend_from_slice(&80877103u32.to_be_bytes());
        self.stream.write_all(&msg).await.unwrap();
        let mut reply = [0u8; 1];
        self.stream.read_exact(&mut reply).await.unwrap();
        reply[0]
    }

    pub async fn send_password(&mut self, password: &str) {
        let mut msg = vec![b'p'];
        msg.extend_from_slice(&((4 + password.len() + 1) as u32).to_be_bytes());
        msg.extend_from_slice(password.as_bytes());
        msg.push(0);
        self.stream.write_all(&msg).await.unwrap();
    }

    /// Read one complete message (identifier, payload).
    pub async fn read_message(&mut self) -> (u8, Vec<u8>) {
        let mut id = [0u8; 1];
        self.stream.read_exact(&mut id).await.unwrap();
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload).await.unwrap();
        (id[0], payload)
    }

    /// Read raw messages until (and including) ReadyForQuery.
    pub async fn read_until_ready(&mut self) -> Vec<u8> {
        let mut collected = Vec::new();
        loop {
            let (id, payload) = self.read_message().await;
            collected.extend_from_slice(&frame(id, &payload));
            if id == b'Z' {
                return collected;
            }
        }
    }

    /// Complete the trust handshake and swallow the greeting.
    pub async fn handshake_trust(&mut self, user: &str, database: &str) {
        self.send_startup(user, database).await;
        self.read_until_ready().await;
    }

    pub async fn simple_query(&mut self, sql: &str) -> Vec<u8> {
        let mut body = sql.as_bytes().to_vec();
        body.push(0);
        self.stream.write_all(&frame(b'Q', &body)).await.unwrap();
        self.read_until_ready().await
    }

    /// Send an unnamed Parse/Bind/Describe/Execute/Sync burst and collect
    /// the response.
    pub async fn extended_select(&mut self, sql: &str) -> Vec<u8> {
        let mut parse = vec![0u8]; // unnamed statement
        parse.extend_from_slice(sql.as_bytes());
        parse.push(0);
        parse.extend_from_slice(&0i16.to_be_bytes()); // no parameter types

        let mut bind = vec![0u8, 0u8]; // unnamed portal, unnamed statement
        bind.extend_from_slice(&0i16.to_be_bytes()); // no format codes
        bind.extend_from_slice(&0i16.to_be_bytes()); // no parameters
        bind.extend_from_slice(&0i16.to_be_bytes()); // no result formats

        let mut describe = vec![b'P'];
        describe.push(0); // unnamed portal

        let mut execute = vec![0u8]; // unnamed portal
        execute.extend_from_slice(&0i32.to_be_bytes()); // no row limit

        let mut burst = frame(b'P', &parse);
        burst.extend_from_slice(&frame(b'B', &bind));
        burst.extend_from_slice(&frame(b'D', &describe));
        burst.extend_from_slice(&frame(b'E', &execute));
        burst.extend_from_slice(&frame(b'S', &[]));
        self.stream.write_all(&burst).await.unwrap();

        self.read_until_ready().await
    }

    pub async fn terminate(mut self) {
        let _ = self.stream.write_all(&frame(b'X', &[])).await;
    }

    /// Expect the connection to be closed by the peer.
    pub async fn expect_eof(&mut self) {
        let mut buf = [0u8; 1];
        match self.stream.read(&mut buf).await {
            Ok(0) => {}
            Ok(_) => panic!("expected EOF, got data"),
            Err(_) => {}
        }
    }
}
