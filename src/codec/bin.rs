//! The binary codec, default wire format for a session.
//!
//! Headers and bodies are bincode-encoded and carried in length-prefixed
//! frames. Writes are buffered and flushed once per `(header, body)` pair;
//! a failed write shuts the stream down before the error is returned so
//! the peer never sees a half-written pair.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::codec::{read_frame, write_frame, CodecRead, CodecWrite, Header};
use crate::error::{Result, RpcError};

pub struct BinReader<R> {
    inner: R,
}

impl<R> BinReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> CodecRead for BinReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_header(&mut self) -> Result<Header> {
        let frame = read_frame(&mut self.inner).await?;
        bincode::deserialize(&frame).map_err(|e| RpcError::Codec(e.to_string()))
    }

    async fn read_body(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.inner).await
    }
}

pub struct BinWriter<W: AsyncWrite + Unpin + Send> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> BinWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner: BufWriter::new(inner) }
    }

    async fn write_pair(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes =
            bincode::serialize(header).map_err(|e| RpcError::Codec(e.to_string()))?;
        write_frame(&mut self.inner, &header_bytes).await?;
        write_frame(&mut self.inner, body).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> CodecWrite for BinWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let res = self.write_pair(header, body).await;
        if res.is_err() {
            let _ = self.inner.shutdown().await;
        }
        res
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
