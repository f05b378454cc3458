//! Startup and authentication handshake
//!
//! Consumes the untyped startup frame (declining SSL/GSS probes with `N`),
//! resolves the user against the credential table, and runs the trust,
//! cleartext, or salted-MD5 flow. On success the client has seen
//! AuthenticationOk, the ParameterStatus burst, and ReadyForQuery, and the
//! caller gets an immutable `Session`.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use pgscale_common::config::{AuthType, Config, Credential};
use pgscale_common::error::{PgScaleError, Result};

use super::messages::{
    send_auth_cleartext_request, send_auth_md5_request, send_authentication_ok, send_fatal_error,
    send_parameter_status, send_ready_for_query, PROTOCOL_VERSION, SERVER_VERSION,
};
use super::reader::read_exact_or_gone;

const SSL_REQUEST_CODE: u32 = 80877103;
const GSS_ENC_REQUEST_CODE: u32 = 80877104;
const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Immutable per-connection session state, created on successful startup.
#[derive(Debug, Clone)]
pub struct Session {
    pub protocol_version: u32,
    pub user: String,
    pub database: String,
    pub application_name: String,
}

/// Run the startup/auth handshake on a fresh client connection.
pub async fn handshake<S>(socket: &mut S, config: &Config) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let startup = read_startup_message(socket).await?;

    let parameters = parse_startup_parameters(&startup);
    let user = parameters.get("user").cloned().unwrap_or_default();
    let session = Session {
        protocol_version: PROTOCOL_VERSION,
        database: parameters.get("database").cloned().unwrap_or_default(),
        application_name: parameters
            .get("application_name")
            .cloned()
            .unwrap_or_default(),
        user,
    };

    debug!(
        user = %session.user,
        database = %session.database,
        "Startup message received"
    );

    let Some(credential) = config.auth.users.get(&session.user) else {
        let err = PgScaleError::NoSuchUser(session.user.clone());
        send_fatal_error(socket, err.sqlstate(), &err.to_string()).await?;
        return Err(err);
    };

    match credential.auth_type {
        AuthType::Trust => {}
        AuthType::Password => {
            send_auth_cleartext_request(socket).await?;
            socket.flush().await?;
            let password = read_password_message(socket).await?;
            if Some(password.as_str()) != credential.password.as_deref() {
                return fail_password(socket, &session.user).await;
            }
        }
        AuthType::Md5 => {
            let salt: [u8; 4] = rand::random();
            send_auth_md5_request(socket, salt).await?;
            socket.flush().await?;
            let password = read_password_message(socket).await?;
            if !check_md5_password(credential, &salt, &password) {
                return fail_password(socket, &session.user).await;
            }
        }
    }

    send_authentication_ok(socket).await?;
    send_parameter_status(socket, "server_version", SERVER_VERSION).await?;
    send_parameter_status(socket, "client_encoding", "UTF8").await?;
    send_ready_for_query(socket, b'I').await?;
    socket.flush().await?;

    info!(user = %session.user, database = %session.database, "Authentication completed");
    Ok(session)
}

/// Read the startup frame, answering SSL and GSS probes with a single `N`
/// and closing on a CancelRequest probe.
async fn read_startup_message<S>(socket: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut len_buf = [0u8; 4];
        read_exact_or_gone(socket, &mut len_buf).await?;
        let length = u32::from_be_bytes(len_buf) as usize;

        if !(8..=10_000).contains(&length) {
            return Err(PgScaleError::Protocol(format!(
                "invalid startup message length: {length}"
            )));
        }

        let mut body = vec![0u8; length - 4];
        read_exact_or_gone(socket, &mut body).await?;

        if length == 8 {
            let code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            match code {
                SSL_REQUEST_CODE | GSS_ENC_REQUEST_CODE => {
                    debug!("SSL/GSS negotiation requested, declining");
                    socket.write_all(b"N").await?;
                    socket.flush().await?;
                    continue;
                }
                _ => {}
            }
        }

        if body.len() >= 4 {
            let code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            if code == CANCEL_REQUEST_CODE {
                debug!("CancelRequest received, closing probe connection");
                return Err(PgScaleError::ClientGone);
            }
        }

        return Ok(body);
    }
}

/// Parse the NUL-separated key/value pairs after the protocol version.
fn parse_startup_parameters(body: &[u8]) -> HashMap<String, String> {
    let mut parameters = HashMap::new();
    if body.len() < 4 {
        return parameters;
    }

    let mut iter = body[4..].split(|&b| b == 0);
    while let Some(key) = iter.next() {
        if key.is_empty() {
            break;
        }
        let Some(value) = iter.next() else { break };
        parameters.insert(
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }
    parameters
}

/// Read a PasswordMessage ('p') and return the password string.
async fn read_password_message<S>(socket: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut msg_type = [0u8; 1];
    read_exact_or_gone(socket, &mut msg_type).await?;
    if msg_type[0] != b'p' {
        return Err(PgScaleError::Protocol(format!(
            "expected password message, got '{}'",
            msg_type[0] as char
        )));
    }

    let mut len_buf = [0u8; 4];
    read_exact_or_gone(socket, &mut len_buf).await?;
    let length = u32::from_be_bytes(len_buf) as usize;
    if length < 4 {
        return Err(PgScaleError::Protocol(format!(
            "invalid password message length: {length}"
        )));
    }

    let mut body = vec![0u8; length - 4];
    read_exact_or_gone(socket, &mut body).await?;

    Ok(String::from_utf8_lossy(&body)
        .trim_end_matches('\0')
        .to_string())
}

/// Verify a salted MD5 response: `"md5" + md5_hex(stored_hash + salt)`
/// where `stored_hash = md5_hex(password + username)`.
fn check_md5_password(credential: &Credential, salt: &[u8; 4], response: &str) -> bool {
    let Some(stored_hash) = credential.hash.as_deref() else {
        return false;
    };
    expected_md5_response(stored_hash, salt) == response
}

pub(crate) fn expected_md5_response(stored_hash: &str, salt: &[u8; 4]) -> String {
    let mut input = Vec::with_capacity(stored_hash.len() + 4);
    input.extend_from_slice(stored_hash.as_bytes());
    input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&input))
}

async fn fail_password<S>(socket: &mut S, user: &str) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!(user = %user, "Password authentication failed");
    let err = PgScaleError::AuthenticationFailed(user.to_string());
    send_fatal_error(socket, err.sqlstate(), &err.to_string()).await?;
    Err(err)
}
