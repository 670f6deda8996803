//! Session options and the connection handshake.
//!
//! The first frame on every connection is an options document encoded in
//! a fixed self-describing format (length-prefixed JSON), independent of
//! the codec the session goes on to negotiate. The magic number marks the
//! stream as speaking this protocol; a server that reads anything else
//! closes the connection without replying.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, CodecKind};
use crate::error::{Result, RpcError};

/// Marks a connection as speaking this RPC protocol.
pub const MAGIC: u32 = 0x3BEF5C;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-session options, sent by the client as the handshake frame.
#[derive(Debug, Clone)]
pub struct Options {
    /// Wire format for every frame after the handshake.
    pub codec: CodecKind,
    /// Client-side bound on dial plus handshake. Zero means no limit.
    pub connect_timeout: Duration,
    /// Server-side bound on running a single handler. Zero means no limit.
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            codec: CodecKind::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

/// The handshake document as it appears on the wire. Durations travel as
/// integral milliseconds so the encoding stays self-describing.
#[derive(Debug, Serialize, Deserialize)]
struct Handshake {
    magic: u32,
    codec: String,
    connect_timeout_ms: u64,
    handle_timeout_ms: u64,
}

pub(crate) async fn write_handshake<W>(dest: &mut W, options: &Options) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let handshake = Handshake {
        magic: MAGIC,
        codec: options.codec.tag().to_string(),
        connect_timeout_ms: options.connect_timeout.as_millis() as u64,
        handle_timeout_ms: options.handle_timeout.as_millis() as u64,
    };
    let payload = serde_json::to_vec(&handshake).map_err(|e| RpcError::Codec(e.to_string()))?;
    codec::write_frame(dest, &payload).await?;
    dest.flush().await?;
    Ok(())
}

/// Reads and validates the handshake frame. Bad magic and unknown codec
/// tags are errors; the caller drops the connection without writing.
pub(crate) async fn read_handshake<R>(src: &mut R) -> Result<Options>
where
    R: AsyncRead + Unpin,
{
    let payload = codec::read_frame(src).await?;
    let handshake: Handshake =
        serde_json::from_slice(&payload).map_err(|e| RpcError::Codec(e.to_string()))?;
    if handshake.magic != MAGIC {
        return Err(RpcError::Protocol(format!(
            "invalid magic number {:#x}",
            handshake.magic
        )));
    }
    let codec = CodecKind::from_tag(&handshake.codec)?;
    Ok(Options {
        codec,
        connect_timeout: Duration::from_millis(handshake.connect_timeout_ms),
        handle_timeout: Duration::from_millis(handshake.handle_timeout_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.codec, CodecKind::Bin);
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert!(options.handle_timeout.is_zero());
    }

    #[tokio::test]
    async fn handshake_round_trip() {
        let (mut send, mut recv) = tokio::io::duplex(1024);
        let options = Options {
            codec: CodecKind::Json,
            connect_timeout: Duration::from_secs(3),
            handle_timeout: Duration::from_secs(1),
        };
        write_handshake(&mut send, &options).await.expect("write handshake");

        let back = read_handshake(&mut recv).await.expect("read handshake");
        assert_eq!(back.codec, CodecKind::Json);
        assert_eq!(back.connect_timeout, Duration::from_secs(3));
        assert_eq!(back.handle_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn rejects_wrong_magic() {
        let (mut send, mut recv) = tokio::io::duplex(1024);
        let payload = serde_json::to_vec(&Handshake {
            magic: 0xBADBAD,
            codec: CodecKind::Bin.tag().to_string(),
            connect_timeout_ms: 0,
            handle_timeout_ms: 0,
        })
        .unwrap();
        codec::write_frame(&mut send, &payload).await.unwrap();
        send.flush().await.unwrap();

        let err = read_handshake(&mut recv).await.expect_err("expected magic error");
        assert!(err.to_string().contains("invalid magic number"));
    }

    #[tokio::test]
    async fn rejects_unknown_codec_tag() {
        let (mut send, mut recv) = tokio::io::duplex(1024);
        let payload = serde_json::to_vec(&Handshake {
            magic: MAGIC,
            codec: "application/msgpack".to_string(),
            connect_timeout_ms: 0,
            handle_timeout_ms: 0,
        })
        .unwrap();
        codec::write_frame(&mut send, &payload).await.unwrap();
        send.flush().await.unwrap();

        let err = read_handshake(&mut recv).await.expect_err("expected codec error");
        assert!(err.to_string().contains("invalid codec type"));
    }
}
