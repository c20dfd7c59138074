use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A connected stream the pool can hand out, take back and health-check.
pub trait StreamSocket: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {
    /// The connection has not been closed by either side.
    fn is_connected(&self) -> bool;

    /// Connected, with no unread bytes and no half-close pending.
    fn is_connected_and_idle(&self) -> bool;

    /// Any bytes were ever read from or written to this socket.
    fn was_ever_used(&self) -> bool;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Close the connection; subsequent health checks report disconnected.
    fn disconnect(&mut self);
}

/// A pooled TCP connection.
#[derive(Debug)]
pub struct TcpSocket {
    stream: Option<TcpStream>,
    was_ever_used: bool,
}

enum PeekState {
    Idle,
    DataPending,
    Closed,
}

impl TcpSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            was_ever_used: false,
        }
    }

    /// Non-blocking peek; tokio sockets are already in non-blocking mode.
    fn peek_state(&self) -> PeekState {
        let Some(stream) = &self.stream else {
            return PeekState::Closed;
        };
        let sock = socket2::SockRef::from(stream);
        let mut buf = [MaybeUninit::<u8>::uninit(); 1];
        match sock.peek(&mut buf) {
            Ok(0) => PeekState::Closed,
            Ok(_) => PeekState::DataPending,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => PeekState::Idle,
            Err(_) => PeekState::Closed,
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket disconnected"))
    }
}

impl StreamSocket for TcpSocket {
    fn is_connected(&self) -> bool {
        // Unread data still means the peer has not closed yet.
        !matches!(self.peek_state(), PeekState::Closed)
    }

    fn is_connected_and_idle(&self) -> bool {
        matches!(self.peek_state(), PeekState::Idle)
    }

    fn was_ever_used(&self) -> bool {
        self.was_ever_used
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.stream {
            Some(stream) => stream.peer_addr(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket disconnected",
            )),
        }
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }
}

impl AsyncRead for TcpSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        let stream = this.stream_mut()?;
        let result = Pin::new(stream).poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.was_ever_used = true;
        }
        result
    }
}

impl AsyncWrite for TcpSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let stream = this.stream_mut()?;
        let result = Pin::new(stream).poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            this.was_ever_used = true;
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let stream = self.stream_mut()?;
        Pin::new(stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let stream = self.stream_mut()?;
        Pin::new(stream).poll_shutdown(cx)
    }
}
