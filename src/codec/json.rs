//! The JSON codec. Same framing as the binary codec with serde_json
//! payloads, useful when the peer or a debugging capture wants
//! human-readable frames.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::codec::{read_frame, write_frame, CodecRead, CodecWrite, Header};
use crate::error::{Result, RpcError};

pub struct JsonReader<R> {
    inner: R,
}

impl<R> JsonReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> CodecRead for JsonReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_header(&mut self) -> Result<Header> {
        let frame = read_frame(&mut self.inner).await?;
        serde_json::from_slice(&frame).map_err(|e| RpcError::Codec(e.to_string()))
    }

    async fn read_body(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.inner).await
    }
}

pub struct JsonWriter<W: AsyncWrite + Unpin + Send> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner: BufWriter::new(inner) }
    }

    async fn write_pair(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes =
            serde_json::to_vec(header).map_err(|e| RpcError::Codec(e.to_string()))?;
        write_frame(&mut self.inner, &header_bytes).await?;
        write_frame(&mut self.inner, body).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> CodecWrite for JsonWriter<W>
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
