//! Riptide Transport - BitTorrent peer connection layer
//!
//! This crate provides the byte-level plumbing underneath the peer wire
//! protocol: piece and block geometry, RC4 stream encryption, buffered
//! socket I/O with idle timeouts, and dispatch of read, write and error
//! notifications to protocol callbacks.

pub mod config;
pub mod network;
pub mod torrent;
pub mod tracing_setup;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

// Re-export main types for convenient access
pub use config::{NetworkConfig, RiptideConfig, TorrentConfig};
pub use network::{EncryptionMode, PeerCipher, PeerIo, PeerIoSession, ReadState, TransportError};
pub use torrent::{BlockIndex, InfoHash, PeerId, PieceIndex, TorrentError, TorrentGeometry};
