//! Socket open/close primitives used by peer connections.
//!
//! Opening goes through the [`SocketOpener`] trait so the session can swap
//! the production TCP connector for a scripted one.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};

use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// Opens outgoing peer sockets.
#[async_trait]
pub trait SocketOpener: Send + Sync {
    /// Opens a TCP connection to `address`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If the connection is refused or times out
    /// - `TorrentError::Io` - If no socket could be created for the address family
    async fn open_outgoing(&self, address: SocketAddr) -> Result<TcpStream, TorrentError>;
}

/// Production opener using real TCP connections.
#[derive(Debug, Clone)]
pub struct TcpSocketOpener {
    connect_timeout: Duration,
    socket_tos: Option<u8>,
}

impl TcpSocketOpener {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            socket_tos: None,
        }
    }

    /// Creates an opener with the connect timeout and socket TOS from `config`.
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            connect_timeout: config.peer_connect_timeout,
            socket_tos: config.peer_socket_tos,
        }
    }

    /// Sets the type-of-service byte applied to every opened IPv4 socket.
    pub fn with_socket_tos(mut self, tos: u8) -> Self {
        self.socket_tos = Some(tos);
        self
    }

    fn prepare_socket(&self, address: SocketAddr) -> io::Result<TcpSocket> {
        let socket = match address {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };

        // TOS is an IPv4 header field; IPv6 sockets keep their traffic class.
        if let Some(tos) = self.socket_tos
            && address.is_ipv4()
        {
            #[allow(deprecated)]
            let result = socket.set_tos(u32::from(tos));
            if let Err(e) = result {
                tracing::debug!("Could not set TOS {tos:#04x} for {address}: {e}");
            }
        }

        Ok(socket)
    }
}

#[async_trait]
impl SocketOpener for TcpSocketOpener {
    async fn open_outgoing(&self, address: SocketAddr) -> Result<TcpStream, TorrentError> {
        let socket = self.prepare_socket(address)?;

        let connect = tokio::time::timeout(self.connect_timeout, socket.connect(address));
        let stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Failed to connect to {address}: {e}"),
                });
            }
            Err(_) => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Connection to {address} timed out"),
                });
            }
        };

        // Protocol messages are small and latency-sensitive.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not disable Nagle for {address}: {e}");
        }

        Ok(stream)
    }
}

/// Shuts down the write half and releases the socket.
pub async fn close_socket(mut stream: TcpStream) {
    if let Err(e) = stream.shutdown().await {
        tracing::trace!("Socket shutdown reported: {e}");
    }
}
