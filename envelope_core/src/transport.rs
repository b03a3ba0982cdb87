//! # Framed Transport
//!
//! One TCP stream carrying CRLF-framed payloads. A connection is used for
//! strict request-then-response exchanges; nothing is pipelined.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::trace;

use crate::codec::CrLfCodec;
use crate::error::NetworkError;

pub struct FramedConnection {
    framed: Framed<TcpStream, CrLfCodec>,
    peer_addr: SocketAddr,
}

impl FramedConnection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, max_frame_len: usize) -> Result<Self, NetworkError> {
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, CrLfCodec::new(max_frame_len)),
            peer_addr,
        })
    }

    /// Open a connection, giving up after `connect_timeout`.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        connect_timeout: Duration,
        max_frame_len: usize,
    ) -> Result<Self, NetworkError> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout(connect_timeout))??;
        let peer_addr = stream.peer_addr()?;
        Self::new(stream, peer_addr, max_frame_len)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Write one frame and flush it.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), NetworkError> {
        self.framed.send(Bytes::copy_from_slice(payload)).await?;
        trace!(peer = %self.peer_addr, bytes = payload.len(), "frame sent");
        Ok(())
    }

    /// Wait for one complete frame, however long it takes.
    pub async fn receive(&mut self) -> Result<BytesMut, NetworkError> {
        match self.framed.next().await {
            Some(Ok(frame)) => {
                trace!(peer = %self.peer_addr, bytes = frame.len(), "frame received");
                Ok(frame)
            }
            Some(Err(e)) => Err(e),
            None => Err(NetworkError::Reset),
        }
    }

    pub async fn receive_with_timeout(&mut self, limit: Duration) -> Result<BytesMut, NetworkError> {
        timeout(limit, self.receive())
            .await
            .map_err(|_| NetworkError::Timeout(limit))?
    }

    /// `true` once the peer has closed its side (or sent something unsolicited).
    /// Used before reusing an idle connection.
    pub fn is_stale(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.framed.get_ref().try_read(&mut probe) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => !self.framed.read_buffer().is_empty(),
            _ => true,
        }
    }
}

/// A socket fresh out of the accept queue, not yet framed.
///
/// Setting it up can still fail (the peer may already have reset it); that
/// is a problem of this one connection, not of the listener.
pub struct Incoming {
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_frame_len: usize,
}

impl Incoming {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn into_connection(self) -> Result<FramedConnection, NetworkError> {
        FramedConnection::new(self.stream, self.peer_addr, self.max_frame_len)
    }
}

/// Listening side: every accepted stream becomes a [`FramedConnection`].
pub struct FramedListener {
    listener: TcpListener,
    max_frame_len: usize,
}

impl FramedListener {
    pub async fn bind(addr: impl ToSocketAddrs, max_frame_len: usize) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, max_frame_len })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    /// Errors here come from the listening socket itself.
    pub async fn accept(&self) -> Result<Incoming, NetworkError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        Ok(Incoming { stream, peer_addr, max_frame_len: self.max_frame_len })
    }
}
