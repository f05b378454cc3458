//! Typed frame decoding for the PostgreSQL wire protocol
//!
//! Every regular message is a 1-byte identifier followed by a 4-byte
//! big-endian length that includes itself but not the identifier. The
//! startup message is the one exception: no identifier, just length and
//! payload, read once per connection through `read_startup`.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use pgscale_common::error::{PgScaleError, Result};

/// Identifier byte plus the 4-byte length prefix.
pub const HEADER_LEN: usize = 5;

/// One decoded wire frame. The raw header is kept so the frame can be
/// forwarded verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub identifier: u8,
    pub header: [u8; HEADER_LEN],
    pub payload: Bytes,
}

impl Frame {
    /// Reproduce the exact bytes this frame arrived as.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + self.payload.len());
        data.extend_from_slice(&self.header);
        data.extend_from_slice(&self.payload);
        data
    }
}

/// Frame decoder over a byte stream.
pub struct FrameReader<S> {
    src: S,
}

impl<S: AsyncRead + Unpin> FrameReader<S> {
    pub fn new(src: S) -> Self {
        Self { src }
    }

    /// Read one typed frame. End-of-stream on a frame boundary or inside a
    /// frame means the peer hung up, reported as `ClientGone`.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_or_gone(&mut self.src, &mut header).await?;

        let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if length < 4 {
            return Err(PgScaleError::Protocol(format!(
                "invalid frame length: {length}"
            )));
        }

        let mut payload = vec![0u8; length as usize - 4];
        read_exact_or_gone(&mut self.src, &mut payload).await?;

        Ok(Frame {
            identifier: header[0],
            header,
            payload: Bytes::from(payload),
        })
    }

    /// Read the untyped startup frame and return its payload.
    pub async fn read_startup(&mut self) -> Result<Bytes> {
        let mut len_buf = [0u8; 4];
        read_exact_or_gone(&mut self.src, &mut len_buf).await?;

        let length = u32::from_be_bytes(len_buf) as usize;
        // Startup messages are small; anything outsized is a stray client.
        if !(8..=10_000).contains(&length) {
            return Err(PgScaleError::Protocol(format!(
                "invalid startup message length: {length}"
            )));
        }

        let mut payload = vec![0u8; length - 4];
        read_exact_or_gone(&mut self.src, &mut payload).await?;
        Ok(Bytes::from(payload))
    }

    /// Access the underlying stream, e.g. to write a reply mid-handshake.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.src
    }

    /// Give the underlying stream back, e.g. after the handshake.
    pub fn into_inner(self) -> S {
        self.src
    }
}

/// `read_exact` with end-of-stream classified as the peer hanging up.
pub(crate) async fn read_exact_or_gone<S: AsyncRead + Unpin>(
    src: &mut S,
    buf: &mut [u8],
) -> Result<()> {
    match src.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(PgScaleError::ClientGone),
        Err(e) => Err(e.into()),
    }
}
