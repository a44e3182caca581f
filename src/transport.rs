//! Transport collaborator.
//!
//! The core only needs a byte-oriented duplex stream with close
//! notification; the networking layer supplies it. [`Transport`] is a
//! blanket trait over async read/write, and [`TlsUpgrader`] is the single
//! decision point for the transport-security upgrade — certificate
//! management stays outside this crate.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::Result;

/// A byte-oriented duplex transport.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Boxed transport handed to a connection.
pub type BoxedTransport = Box<dyn Transport>;

/// Hook that wraps a transport in a security layer when STARTTLS is
/// negotiated.
///
/// The upgrade runs after the `StartTls` frame exchange and before any
/// authentication frame is sent.
#[async_trait]
pub trait TlsUpgrader: Send + Sync {
    /// Upgrade the initiator side.
    async fn upgrade_initiator(&self, transport: BoxedTransport) -> std::io::Result<BoxedTransport>;

    /// Upgrade the acceptor side.
    async fn upgrade_acceptor(&self, transport: BoxedTransport) -> std::io::Result<BoxedTransport>;
}

/// Connect a TCP transport to `addr`.
///
/// `TCP_NODELAY` is set; protocol frames are small and latency-sensitive.
pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<BoxedTransport> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

/// Wrap an accepted TCP stream as a transport.
pub fn from_tcp(stream: TcpStream) -> Result<BoxedTransport> {
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

/// In-memory transport pair for tests and local benchmarks.
pub fn memory_pair(buffer: usize) -> (BoxedTransport, BoxedTransport) {
    let (a, b) = tokio::io::duplex(buffer);
    (Box::new(a), Box::new(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_pair_is_duplex() {
        let (mut a, mut b) = memory_pair(1024);

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            from_tcp(stream).unwrap()
        });

        let mut client = connect_tcp(addr).await.unwrap();
        let mut server = accept.await.unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
