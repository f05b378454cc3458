//! PostgreSQL wire protocol message builders
//!
//! Frame construction for the handshake messages the proxy emits towards
//! clients, and for the frontend messages the pool driver sends towards the
//! upstream. Builders return raw bytes; the `send_*` helpers write them to
//! any async stream.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use pgscale_common::error::Result;

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: u32 = 196608; // (3 << 16)

/// Reported to clients in the post-auth ParameterStatus burst.
pub const SERVER_VERSION: &str = "13.4 (Debian 13.4-1.pgdg100+1)";

/// Send AuthenticationOk
pub async fn send_authentication_ok<S>(socket: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'R', 0, 0, 0, 8, 0, 0, 0, 0]).await?;
    Ok(())
}

/// Send AuthenticationCleartextPassword
pub async fn send_auth_cleartext_request<S>(socket: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'R', 0, 0, 0, 8, 0, 0, 0, 3]).await?;
    Ok(())
}

/// Send AuthenticationMD5Password with the challenge salt
pub async fn send_auth_md5_request<S>(socket: &mut S, salt: [u8; 4]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut msg = vec![b'R', 0, 0, 0, 12, 0, 0, 0, 5];
    msg.extend_from_slice(&salt);
    socket.write_all(&msg).await?;
    Ok(())
}

/// Send ParameterStatus
pub async fn send_parameter_status<S>(socket: &mut S, name: &str, value: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut msg = Vec::new();
    msg.push(b'S');
    msg.extend_from_slice(&[0, 0, 0, 0]); // length placeholder
    msg.extend_from_slice(name.as_bytes());
    msg.push(0);
    msg.extend_from_slice(value.as_bytes());
    msg.push(0);
    let len = (msg.len() - 1) as u32;
    msg[1..5].copy_from_slice(&len.to_be_bytes());
    socket.write_all(&msg).await?;
    Ok(())
}

/// Send ReadyForQuery with the given transaction status
pub async fn send_ready_for_query<S>(socket: &mut S, status: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'Z', 0, 0, 0, 5, status]).await?;
    Ok(())
}

/// Build a FATAL ErrorResponse with a SQLSTATE code
pub fn build_fatal_error(code: &str, message: &str) -> Vec<u8> {
    let mut fields = Vec::new();
    fields.push(b'S');
    fields.extend_from_slice(b"FATAL");
    fields.push(0);
    fields.push(b'V');
    fields.extend_from_slice(b"FATAL");
    fields.push(0);
    fields.push(b'C');
    fields.extend_from_slice(code.as_bytes());
    fields.push(0);
    fields.push(b'M');
    fields.extend_from_slice(message.as_bytes());
    fields.push(0);
    fields.push(0); // terminator

    let mut buf = Vec::with_capacity(5 + fields.len());
    buf.push(b'E');
    buf.extend_from_slice(&((4 + fields.len()) as u32).to_be_bytes());
    buf.extend_from_slice(&fields);
    buf
}

/// Send a FATAL ErrorResponse; the connection is expected to close after.
pub async fn send_fatal_error<S>(socket: &mut S, code: &str, message: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&build_fatal_error(code, message)).await?;
    socket.flush().await?;
    Ok(())
}

/// Build the untyped StartupMessage the pool driver sends upstream.
pub fn build_startup_message(parameters: &[(&str, &str)]) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&[0, 0, 0, 0]); // length placeholder
    msg.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    for (key, value) in parameters {
        msg.extend_from_slice(key.as_bytes());
        msg.push(0);
        msg.extend_from_slice(value.as_bytes());
        msg.push(0);
    }
    msg.push(0); // terminator
    let len = msg.len() as u32;
    msg[0..4].copy_from_slice(&len.to_be_bytes());
    msg
}

/// Build a PasswordMessage ('p')
pub fn build_password_message(password: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(6 + password.len());
    msg.push(b'p');
    msg.extend_from_slice(&((4 + password.len() + 1) as u32).to_be_bytes());
    msg.extend_from_slice(password.as_bytes());
    msg.push(0);
    msg
}

/// Build a simple Query message ('Q')
pub fn build_query_message(sql: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(6 + sql.len());
    msg.push(b'Q');
    msg.extend_from_slice(&((4 + sql.len() + 1) as u32).to_be_bytes());
    msg.extend_from_slice(sql.as_bytes());
    msg.push(0);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_error_layout() {
        let buf = build_fatal_error("28P01", "password authentication failed for user \"bob\"");
        assert_eq!(buf[0], b'E');
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
        // Severity, code, and message fields are all present
        let body = &buf[5..];
        assert!(body.windows(6).any(|w| w == b"SFATAL"));
        assert!(body.windows(6).any(|w| w == b"C28P01"));
    }

    #[test]
    fn test_startup_message_layout() {
        let buf = build_startup_message(&[("user", "app"), ("database", "appdb")]);
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len());
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(buf[buf.len() - 1], 0);
    }

    #[test]
    fn test_query_message_layout() {
        let buf = build_query_message("SELECT 1");
        assert_eq!(buf[0], b'Q');
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[tokio::test]
    async fn test_ready_for_query_bytes() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        send_ready_for_query(&mut tx, b'I').await.unwrap();
        let mut buf = [0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut rx, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, [b'Z', 0, 0, 0, 5, b'I']);
    }
}
