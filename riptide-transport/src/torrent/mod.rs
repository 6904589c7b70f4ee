//! Torrent identity types and piece/block geometry

pub mod geometry;

use std::fmt;

pub use geometry::{MAX_BLOCK_SIZE, RequestRejection, TorrentGeometry};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Also the torrent-specific input to the peer stream cipher key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// BitTorrent peer identifier.
///
/// Set on a connection once the remote handshake has been read.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a random peer ID carrying the given client prefix.
    ///
    /// Prefixes longer than 20 bytes are truncated.
    pub fn generate(client_prefix: &str) -> Self {
        let mut id: [u8; 20] = rand::random();
        let prefix = client_prefix.as_bytes();
        let len = prefix.len().min(id.len());
        id[..len].copy_from_slice(&prefix[..len]);
        Self(id)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based index of a block across the whole torrent.
///
/// Blocks are the unit of peer requests; block `n` of piece `p` has the
/// torrent-wide index `p * blocks_per_piece + n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    /// Creates BlockIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying block index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur in peer transport and torrent geometry operations.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Invalid torrent geometry: {reason}")]
    InvalidGeometry { reason: String },

    #[error("Torrent hash has not been set for this connection")]
    MissingTorrentHash,

    #[error("Stream cipher keys have not been initialised")]
    CipherNotInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
