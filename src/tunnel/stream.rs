//! Channel-backed stream (§4.1): a full-duplex byte stream over a single
//! SSH channel, wrapping `russh`'s own `ChannelStream` and tagging it with
//! the addresses of the parent connection (the channel transport itself
//! has no notion of "the other end's socket").

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use russh::server::Msg;
use russh::{Channel, ChannelStream as RusshChannelStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Wraps one SSH channel as a byte stream. `local_addr`/`peer_addr` are
/// fixed at construction from the parent connection's socket addresses;
/// they do not change even though several `ChannelStream`s can share one
/// underlying TCP connection.
pub struct ChannelStream {
    inner: RusshChannelStream<Msg>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl ChannelStream {
    pub fn new(channel: Channel<Msg>, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            inner: channel.into_stream(),
            local_addr,
            peer_addr,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The transport carries no per-channel deadline; accepted for
    /// interface parity with `TcpStream` and otherwise ignored.
    pub fn set_read_timeout(&self, _timeout: Option<std::time::Duration>) {}

    /// See `set_read_timeout`.
    pub fn set_write_timeout(&self, _timeout: Option<std::time::Duration>) {}

    /// Closes this channel only; the parent connection keeps serving its
    /// other channels.
    pub async fn close(self) -> Result<(), russh::Error> {
        self.inner.close().await
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
