use std::future::Future;
use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::TcpStream;

/// An ordered, reliable byte channel to one peer.
///
/// Reads and writes are non-blocking and follow the usual
/// [`io::ErrorKind::WouldBlock`] convention: `WouldBlock` means "nothing right
/// now", while a read returning `Ok(0)` means the peer closed the stream. Any
/// stream transport works (TCP, or uTP behind an adapter).
pub trait PeerTransport: Send {
    /// Opens the channel to `addr`.
    fn connect(&mut self, addr: SocketAddr) -> impl Future<Output = io::Result<()>> + Send;

    fn is_connected(&self) -> bool;

    /// Appends whatever bytes are available to `buf`.
    fn try_read(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Writes as much of `data` as the channel accepts right now.
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize>;

    fn close(&mut self);
}

/// [`PeerTransport`] over a tokio [`TcpStream`].
///
/// The reads and writes never wait. A caller driving many connections awaits
/// [`TcpTransport::readable`] between polls.
#[derive(Debug, Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an accepted stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// Waits until the socket has data (or an error) to report.
    pub async fn readable(&self) -> io::Result<()> {
        match &self.stream {
            Some(stream) => stream.readable().await,
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream()?.peer_addr()
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl PeerTransport for TcpTransport {
    async fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn try_read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.stream()?.try_read_buf(buf)
    }

    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream()?.try_write(data)
    }

    fn close(&mut self) {
        self.stream = None;
    }
}
