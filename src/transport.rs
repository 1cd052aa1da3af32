use bytes::{Buf, Bytes, BytesMut};
use futures::future::BoxFuture;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

/// A 24-bit length prefix bounds every frame.
pub const MAX_FRAME_LEN: usize = (1 << 24) - 1;

/// A duplex channel that carries whole frames.
///
/// The connection owns its transport exclusively; `recv` yields one complete
/// frame per call (`None` on orderly EOF) and `send` delivers a frame as one
/// unit or fails. Message-boundary transports (WebSocket and the like)
/// implement this directly; byte-stream transports go through
/// [`FramedTransport`].
pub trait Transport: Send + 'static {
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, io::Result<()>>;
    fn recv(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>>;
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// Frame delimiting over any ordered byte stream: each frame is preceded by
/// a 24-bit big-endian length, per the RSocket TCP transport.
pub struct FramedTransport<S> {
    io: S,
    read_buf: BytesMut,
    max_frame_len: usize,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: S) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(4 * 1024),
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Lower the inbound frame size limit; oversized frames fail the
    /// connection instead of buffering without bound.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max.min(MAX_FRAME_LEN);
        self
    }

    fn buffered_frame(&mut self) -> io::Result<Option<Bytes>> {
        if self.read_buf.len() < 3 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([0, self.read_buf[0], self.read_buf[1], self.read_buf[2]])
            as usize;
        if len > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit of {}", self.max_frame_len),
            ));
        }
        if self.read_buf.len() < 3 + len {
            return Ok(None);
        }
        self.read_buf.advance(3);
        Ok(Some(self.read_buf.split_to(len).freeze()))
    }
}

impl<S> Transport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if frame.len() > self.max_frame_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("frame of {} bytes exceeds limit", frame.len()),
                ));
            }
            let prefix = (frame.len() as u32).to_be_bytes();
            self.io.write_all(&prefix[1..]).await?;
            self.io.write_all(&frame).await?;
            self.io.flush().await
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move {
            loop {
                if let Some(frame) = self.buffered_frame()? {
                    return Ok(Some(frame));
                }
                self.read_buf.reserve(4 * 1024);
                if self.io.read_buf(&mut self.read_buf).await? == 0 {
                    return if self.read_buf.is_empty() {
                        Ok(None)
                    } else {
                        Err(io::ErrorKind::UnexpectedEof.into())
                    };
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move { self.io.shutdown().await })
    }
}

/// Open a `tcp://host:port` transport.
pub async fn connect_tcp(url: &Url) -> io::Result<FramedTransport<TcpStream>> {
    let (host, port) = tcp_addr(url)?;
    let stream = TcpStream::connect((host.as_str(), port)).await?;
    stream.set_nodelay(true)?;
    Ok(FramedTransport::new(stream))
}

fn tcp_addr(url: &Url) -> io::Result<(String, u16)> {
    if url.scheme() != "tcp" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported scheme: {}", url.scheme()),
        ));
    }
    let host = url
        .host_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "url has no host"))?;
    let port = url
        .port()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "url has no port"))?;
    Ok((host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = FramedTransport::new(a);
        let mut rx = FramedTransport::new(b);

        tx.send(Bytes::from_static(b"hello")).await.unwrap();
        tx.send(Bytes::from_static(b"")).await.unwrap();
        tx.send(Bytes::from_static(b"world!")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(rx.recv().await.unwrap().unwrap(), &b""[..]);
        assert_eq!(rx.recv().await.unwrap().unwrap(), &b"world!"[..]);
    }

    #[tokio::test]
    async fn partial_prefix_waits_for_more() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut rx = FramedTransport::new(b);

        // length prefix split across writes
        a.write_all(&[0, 0]).await.unwrap();
        a.write_all(&[3, b'a']).await.unwrap();
        a.write_all(b"bc").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), &b"abc"[..]);
    }

    #[tokio::test]
    async fn eof_between_frames_is_clean() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = FramedTransport::new(a);
        let mut rx = FramedTransport::new(b);

        tx.send(Bytes::from_static(b"bye")).await.unwrap();
        tx.close().await.unwrap();
        drop(tx);

        assert_eq!(rx.recv().await.unwrap().unwrap(), &b"bye"[..]);
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut rx = FramedTransport::new(b);

        a.write_all(&[0, 0, 9, b'x']).await.unwrap();
        drop(a);

        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut rx = FramedTransport::new(b).with_max_frame_len(16);

        a.write_all(&[0, 1, 0]).await.unwrap();
        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn tcp_addr_parsing() {
        let url = Url::parse("tcp://example.com:7878").unwrap();
        assert_eq!(tcp_addr(&url).unwrap(), ("example.com".to_owned(), 7878));
        assert!(tcp_addr(&Url::parse("ws://example.com:80").unwrap()).is_err());
        assert!(tcp_addr(&Url::parse("tcp://example.com").unwrap()).is_err());
    }
}
