use std::fmt::{Display, Formatter};

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}
impl Endpoint {
    pub fn new(host: &str, port: u16) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port,
        }
    }
}
impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A frame as it travels over the wire: a one-byte tag, a big-endian u32 body length, and the
///  body. Interpreting the body is up to the stream layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawFrame {
    pub tag: u8,
    pub body: Bytes,
}
impl RawFrame {
    pub fn new(tag: u8, body: Bytes) -> RawFrame {
        RawFrame {
            tag,
            body,
        }
    }
}

/// Reads the next frame. Returns `None` if the peer closed the stream cleanly at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_frame_size: usize) -> anyhow::Result<Option<RawFrame>> {
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = reader.read_u32().await? as usize;
    if len > max_frame_size {
        bail!("frame of {} bytes exceeds maximum frame size of {} bytes", len, max_frame_size);
    }

    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await?;
    Ok(Some(RawFrame::new(tag, body.freeze())))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &RawFrame) -> anyhow::Result<()> {
    writer.write_u8(frame.tag).await?;
    writer.write_u32(frame.body.len() as u32).await?;
    writer.write_all(&frame.body).await?;
    writer.flush().await?;
    Ok(())
}


pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens byte streams to the message server. TLS, proxies and the like live behind this trait.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<BoxedStream>;
}

pub struct TcpConnectionFactory {}
#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<BoxedStream> {
        debug!("opening TCP connection to {}", endpoint);
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use super::*;

    #[tokio::test]
    async fn test_frames_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, &RawFrame::new(8, Bytes::from_static(b"hello"))).await.unwrap();
        write_frame(&mut client, &RawFrame::new(0, Bytes::new())).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, 100).await.unwrap(), Some(RawFrame::new(8, Bytes::from_static(b"hello"))));
        assert_eq!(read_frame(&mut server, 100).await.unwrap(), Some(RawFrame::new(0, Bytes::new())));
        assert_eq!(read_frame(&mut server, 100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &RawFrame::new(8, Bytes::from(vec![1u8; 200]))).await.unwrap();

        assert!(read_frame(&mut server, 100).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[8, 0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(client);

        assert!(read_frame(&mut server, 100).await.is_err());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("mtalk.google.com", 5228).to_string(), "mtalk.google.com:5228");
    }
}
