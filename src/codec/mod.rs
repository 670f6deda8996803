//! Message framing and codec plumbing.
//!
//! Every request and every response on a session is a `(Header, Body)`
//! pair. The codec layer is split in two:
//!
//! 1. A frame layer that delimits records on the TCP stream. Each header
//!    and each body travels as a 4-byte big-endian length prefix followed
//!    by that many payload bytes. Stream protocols have no message
//!    boundaries of their own; the prefix restores them and lets a
//!    receiver pre-size its buffer.
//! 2. A value layer ([`CodecKind`]) that turns headers, arguments and
//!    replies into payload bytes. Two wire formats are provided: a compact
//!    binary encoding (the default) and JSON.
//!
//! A codec is constructed already split into a read half and a write half.
//! Each side of a connection drives reads from exactly one task, while
//! writes are serialized by the owner's send lock, so the halves never
//! need to synchronize with each other.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};

mod bin;
mod json;

pub use bin::{BinReader, BinWriter};
pub use json::{JsonReader, JsonWriter};

/// Upper bound on a single frame. A length prefix beyond this is treated
/// as a corrupt stream rather than an allocation request.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// The header preceding every request and response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Qualified method name, format `"Service.Method"`.
    pub service_method: String,
    /// Sequence number chosen by the client, strictly increasing per
    /// connection starting at 1.
    pub seq: u64,
    /// Empty on success; otherwise the error text for this call.
    pub error: String,
}

/// The wire formats a session can negotiate.
///
/// The handshake carries a codec *tag*; [`CodecKind::from_tag`] is the
/// registry that maps tags back to implementations. Unknown tags cause
/// the server to drop the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Length-delimited binary encoding. The default.
    Bin,
    /// Length-delimited JSON.
    Json,
}

impl Default for CodecKind {
    fn default() -> Self {
        CodecKind::Bin
    }
}

impl CodecKind {
    pub fn tag(&self) -> &'static str {
        match self {
            CodecKind::Bin => "application/bincode",
            CodecKind::Json => "application/json",
        }
    }

    pub fn from_tag(tag: &str) -> Result<CodecKind> {
        match tag {
            "application/bincode" => Ok(CodecKind::Bin),
            "application/json" => Ok(CodecKind::Json),
            other => Err(RpcError::InvalidCodec(other.to_string())),
        }
    }

    /// Encodes a value into body bytes in this wire format.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Bin => bincode::serialize(value).map_err(|e| RpcError::Codec(e.to_string())),
            CodecKind::Json => {
                serde_json::to_vec(value).map_err(|e| RpcError::Codec(e.to_string()))
            }
        }
    }

    /// Decodes body bytes into a value of the caller's choosing.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecKind::Bin => bincode::deserialize(bytes).map_err(|e| RpcError::Codec(e.to_string())),
            CodecKind::Json => {
                serde_json::from_slice(bytes).map_err(|e| RpcError::Codec(e.to_string()))
            }
        }
    }
}

/// The receive half of a codec. Driven from a single task per session.
#[async_trait]
pub trait CodecRead: Send {
    async fn read_header(&mut self) -> Result<Header>;

    /// Reads the body frame that follows every header. Must be called
    /// exactly once per header, including for responses the receiver
    /// intends to discard, so the stream stays frame-aligned.
    async fn read_body(&mut self) -> Result<Vec<u8>>;
}

/// The send half of a codec. Callers provide their own mutual exclusion;
/// a single `write` emits the header and body frames back to back and
/// flushes, so the pair is atomic on the wire.
#[async_trait]
pub trait CodecWrite: Send {
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()>;

    /// Shuts down the write side of the stream.
    async fn close(&mut self) -> Result<()>;
}

/// Splits a duplex stream into codec halves for the negotiated format.
pub fn split<S>(kind: CodecKind, stream: S) -> (Box<dyn CodecRead>, Box<dyn CodecWrite>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (r, w) = tokio::io::split(stream);
    match kind {
        CodecKind::Bin => (Box::new(BinReader::new(r)), Box::new(BinWriter::new(w))),
        CodecKind::Json => (Box::new(JsonReader::new(r)), Box::new(JsonWriter::new(w))),
    }
}

/// Reads one length-prefixed frame.
pub(crate) async fn read_frame<R>(src: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0_u8; 4];
    src.read_exact(&mut header_buf).await?;
    let length = u32::from_be_bytes(header_buf) as usize;
    if length > MAX_FRAME_LENGTH {
        return Err(RpcError::Protocol(format!(
            "frame length {} exceeds max {}",
            length, MAX_FRAME_LENGTH
        )));
    }
    let mut payload = vec![0_u8; length];
    src.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes one length-prefixed frame. The caller flushes.
pub(crate) async fn write_frame<W>(dest: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LENGTH {
        return Err(RpcError::Protocol(format!(
            "frame length {} exceeds max {}",
            payload.len(),
            MAX_FRAME_LENGTH
        )));
    }
    dest.write_all(&u32::to_be_bytes(payload.len() as u32)).await?;
    dest.write_all(payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            service_method: "Foo.Sum".to_string(),
            seq: 7,
            error: String::new(),
        }
    }

    #[test]
    fn header_round_trips_in_both_formats() {
        for kind in [CodecKind::Bin, CodecKind::Json] {
            let header = sample_header();
            let bytes = kind.encode(&header).expect("encode header");
            let back: Header = kind.decode(&bytes).expect("decode header");
            assert_eq!(header, back);
        }
    }

    #[test]
    fn tags_resolve_to_their_kind() {
        assert_eq!(CodecKind::from_tag("application/bincode").unwrap(), CodecKind::Bin);
        assert_eq!(CodecKind::from_tag("application/json").unwrap(), CodecKind::Json);
        let err = CodecKind::from_tag("application/msgpack").expect_err("unknown tag");
        assert!(err.to_string().contains("invalid codec type"));
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut send, mut recv) = tokio::io::duplex(64);
        let oversized = (MAX_FRAME_LENGTH + 1) as u32;
        tokio::io::AsyncWriteExt::write_all(&mut send, &oversized.to_be_bytes())
            .await
            .expect("write length prefix");

        let err = read_frame(&mut recv).await.expect_err("expected oversize error");
        assert!(err.to_string().contains("exceeds max"), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut send, mut recv) = tokio::io::duplex(1024);
        write_frame(&mut send, b"hello").await.expect("write frame");
        tokio::io::AsyncWriteExt::flush(&mut send).await.expect("flush");
        let payload = read_frame(&mut recv).await.expect("read frame");
        assert_eq!(payload, b"hello");
    }
}
