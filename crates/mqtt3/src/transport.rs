//! The stream capability the endpoint consumes. Any ordered, reliable
//! byte stream works: plain TCP, TLS, a WebSocket adapter, or an
//! in-memory pipe in tests. The blanket impl covers every tokio stream.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MqttError, Result};

pub trait Transport: Send {
    /// Reads exactly `buf.len()` bytes.
    ///
    /// # Errors
    ///
    /// [`MqttError::ConnectionClosed`] on EOF, [`MqttError::ConnectionReset`]
    /// when the peer tears the stream down, [`MqttError::Io`] otherwise.
    fn read_exact(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<()>> + Send;

    /// Writes the whole buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; no partial packet is
    /// reported as success.
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Best-effort transport close.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be shut down cleanly.
    fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send;
}

impl<T> Transport for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        AsyncReadExt::read_exact(self, buf).await?;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = AsyncWriteExt::write(self, &buf[written..]).await?;
            if n == 0 {
                return Err(MqttError::WriteSizeMismatch {
                    expected: buf.len(),
                    actual: written,
                });
            }
            written += n;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        AsyncWriteExt::shutdown(self).await?;
        Ok(())
    }
}
