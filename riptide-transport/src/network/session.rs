//! Session state shared by every peer connection.
//!
//! Holds the configuration, the local peer id, the socket opener, the
//! process-wide callback lock and the runtime handle that deferred
//! connection teardown is scheduled on.

use std::future::Future;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tokio::runtime::Handle;

use super::socket::{SocketOpener, TcpSocketOpener};
use crate::config::{NetworkConfig, RiptideConfig, TorrentConfig};
use crate::torrent::{PeerId, TorrentError, TorrentGeometry};

/// Owning session for a set of peer connections.
///
/// Outlives every connection created from it; connections keep an `Arc`.
pub struct PeerIoSession {
    network: NetworkConfig,
    torrent: TorrentConfig,
    peer_id: PeerId,
    socket_opener: Arc<dyn SocketOpener>,
    callback_lock: ReentrantMutex<()>,
    runtime: Handle,
}

impl PeerIoSession {
    /// Creates a session that opens sockets over plain TCP.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new(config: RiptideConfig) -> Arc<Self> {
        let opener = Arc::new(TcpSocketOpener::from_config(&config.network));
        Self::with_socket_opener(config, opener)
    }

    /// Creates a session with a custom socket opener.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn with_socket_opener(
        config: RiptideConfig,
        socket_opener: Arc<dyn SocketOpener>,
    ) -> Arc<Self> {
        let peer_id = PeerId::generate(config.torrent.client_id);
        tracing::debug!("Peer session started as {:?}", peer_id);

        Arc::new(Self {
            network: config.network,
            torrent: config.torrent,
            peer_id,
            socket_opener,
            callback_lock: ReentrantMutex::new(()),
            runtime: Handle::current(),
        })
    }

    pub fn network_config(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn torrent_config(&self) -> &TorrentConfig {
        &self.torrent
    }

    /// Peer id this client announces, carrying the configured client prefix.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Derives a torrent's geometry with the session's maximum block size.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidGeometry` - See [`TorrentGeometry::from_config`]
    pub fn geometry(
        &self,
        piece_length: u32,
        total_size: u64,
    ) -> Result<TorrentGeometry, TorrentError> {
        TorrentGeometry::from_config(&self.torrent, piece_length, total_size)
    }

    pub fn socket_opener(&self) -> &dyn SocketOpener {
        self.socket_opener.as_ref()
    }

    /// Acquires the lock that serialises read callbacks across all connections.
    ///
    /// Reentrant: a thread already holding it may take it again.
    pub fn lock_callbacks(&self) -> ReentrantMutexGuard<'_, ()> {
        self.callback_lock.lock()
    }

    /// Returns true while any thread is inside a read callback.
    pub fn callbacks_locked(&self) -> bool {
        self.callback_lock.is_locked()
    }

    /// Schedules `task` on the session's event loop without waiting for it.
    pub fn run_in_event_loop<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }
}

impl std::fmt::Debug for PeerIoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIoSession")
            .field("network", &self.network)
            .field("torrent", &self.torrent)
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_callback_lock_is_reentrant() {
        let session = PeerIoSession::new(RiptideConfig::default());
        assert!(!session.callbacks_locked());

        let outer = session.lock_callbacks();
        let inner = session.lock_callbacks();
        assert!(session.callbacks_locked());
        drop(inner);
        assert!(session.callbacks_locked());
        drop(outer);
        assert!(!session.callbacks_locked());
    }

    #[tokio::test]
    async fn test_run_in_event_loop_executes_task() {
        let session = PeerIoSession::new(RiptideConfig::default());
        let ran = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let flag = Arc::clone(&ran);
        session.run_in_event_loop(async move {
            flag.store(true, Ordering::SeqCst);
            let _ = done_tx.send(());
        });

        done_rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_session_applies_torrent_config() {
        let mut config = RiptideConfig::for_testing();
        config.torrent.client_id = "-XX0042-";
        config.torrent.max_block_size = 8192;

        let session = PeerIoSession::new(config);

        assert_eq!(&session.peer_id().as_bytes()[..8], b"-XX0042-");
        assert_eq!(
            session.network_config().peer_io_timeout,
            NetworkConfig::for_testing().peer_io_timeout
        );

        let geometry = session.geometry(32768, 100_000).unwrap();
        assert_eq!(geometry.block_length(), 8192);
        assert_eq!(geometry.blocks_per_piece(), 4);
    }
}
