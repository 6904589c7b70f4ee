//! Loopback sockets and event-loop helpers shared by unit and integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::network::{PeerIo, PeerIoSession};

/// Returns a connected loopback pair as `(connected, accepted)`.
///
/// # Panics
///
/// Panics if the loopback interface is unavailable.
pub async fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let address = listener.local_addr().expect("listener address");

    let (connected, accepted) = tokio::join!(TcpStream::connect(address), listener.accept());
    let connected = connected.expect("connect to loopback listener");
    let (accepted, _) = accepted.expect("accept loopback connection");
    (connected, accepted)
}

/// Wraps the accepting end of a loopback pair as an incoming connection.
///
/// Returns the connection and the raw remote socket feeding it.
pub async fn incoming_peer_io(session: &Arc<PeerIoSession>) -> (PeerIo, TcpStream) {
    let (remote, accepted) = loopback_pair().await;
    let address: SocketAddr = remote.local_addr().expect("remote address");
    (PeerIo::new_incoming(session, address, accepted), remote)
}

/// Dispatches events on `io` until `done` holds, the connection goes idle,
/// or `limit` elapses. Returns whether `done` was reached.
pub async fn drive_until<F>(io: &mut PeerIo, limit: Duration, mut done: F) -> bool
where
    F: FnMut(&PeerIo) -> bool,
{
    let drive = async {
        loop {
            if done(io) {
                return true;
            }
            if !io.process_next_event().await {
                return done(io);
            }
        }
    };

    tokio::time::timeout(limit, drive).await.unwrap_or(false)
}
