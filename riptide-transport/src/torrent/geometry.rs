//! Piece and block geometry for a single torrent.
//!
//! Maps piece/block indices to byte lengths and offsets, and validates the
//! `(piece, offset, length)` triples peers send in requests. The last piece
//! and the last block are the remainder of the torrent size and are usually
//! shorter than nominal, so every length lookup special-cases `count - 1`.

use super::{BlockIndex, PieceIndex, TorrentError};
use crate::config::TorrentConfig;

/// Largest block a peer may request (16 KiB).
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024;

/// Reason a peer request was rejected by [`TorrentGeometry::validate_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestRejection {
    #[error("piece {piece} is out of range (torrent has {piece_count} pieces)")]
    PieceOutOfRange { piece: PieceIndex, piece_count: u32 },

    #[error("request length must be greater than zero")]
    ZeroLength,

    #[error("range {offset}+{length} exceeds piece length {piece_length}")]
    OutOfBounds {
        offset: u32,
        length: u32,
        piece_length: u32,
    },
}

/// Immutable piece/block layout derived from torrent metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TorrentGeometry {
    total_size: u64,
    piece_length: u32,
    piece_count: u32,
    last_piece_length: u32,
    block_length: u32,
    block_count: u32,
    last_block_length: u32,
    blocks_per_piece: u32,
    blocks_in_last_piece: u32,
}

impl TorrentGeometry {
    /// Derives the geometry of a torrent using the standard 16 KiB request size.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidGeometry` - See [`TorrentGeometry::with_max_block_size`]
    pub fn new(piece_length: u32, total_size: u64) -> Result<Self, TorrentError> {
        Self::with_max_block_size(piece_length, total_size, MAX_BLOCK_SIZE)
    }

    /// Derives the geometry of a torrent using the configured maximum block size.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidGeometry` - See [`TorrentGeometry::with_max_block_size`]
    pub fn from_config(
        config: &TorrentConfig,
        piece_length: u32,
        total_size: u64,
    ) -> Result<Self, TorrentError> {
        Self::with_max_block_size(piece_length, total_size, config.max_block_size)
    }

    /// Derives the geometry of a torrent.
    ///
    /// The block length starts at the piece length and is halved until it no
    /// longer exceeds `max_block_size`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidGeometry` - If any size is zero, the piece length
    ///   is not a whole number of blocks, or the piece/block count overflows u32
    pub fn with_max_block_size(
        piece_length: u32,
        total_size: u64,
        max_block_size: u32,
    ) -> Result<Self, TorrentError> {
        if piece_length == 0 || total_size == 0 || max_block_size == 0 {
            return Err(TorrentError::InvalidGeometry {
                reason: format!(
                    "sizes must be non-zero (piece length {piece_length}, total size {total_size}, max block size {max_block_size})"
                ),
            });
        }

        let mut block_length = piece_length;
        while block_length > max_block_size {
            block_length /= 2;
        }

        if piece_length % block_length != 0 {
            return Err(TorrentError::InvalidGeometry {
                reason: format!(
                    "piece length {piece_length} is not a multiple of block length {block_length}"
                ),
            });
        }

        let piece_count = count_units(total_size, piece_length)?;
        let block_count = count_units(total_size, block_length)?;

        // Remainders are never larger than the nominal unit, so they fit in u32.
        let last_piece_length =
            (total_size - u64::from(piece_length) * u64::from(piece_count - 1)) as u32;
        let last_block_length =
            (total_size - u64::from(block_length) * u64::from(block_count - 1)) as u32;

        Ok(Self {
            total_size,
            piece_length,
            piece_count,
            last_piece_length,
            block_length,
            block_count,
            last_block_length,
            blocks_per_piece: piece_length / block_length,
            blocks_in_last_piece: last_piece_length.div_ceil(block_length),
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Nominal piece length; every piece except possibly the last has this size.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn last_piece_length(&self) -> u32 {
        self.last_piece_length
    }

    /// Nominal block length; every block except possibly the last has this size.
    pub fn block_length(&self) -> u32 {
        self.block_length
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn last_block_length(&self) -> u32 {
        self.last_block_length
    }

    pub fn blocks_per_piece(&self) -> u32 {
        self.blocks_per_piece
    }

    pub fn blocks_in_last_piece(&self) -> u32 {
        self.blocks_in_last_piece
    }

    /// Returns the index of the first block of `piece`.
    pub fn piece_first_block(&self, piece: PieceIndex) -> BlockIndex {
        BlockIndex(piece.0 * self.blocks_per_piece)
    }

    /// Returns the piece containing `block`.
    pub fn block_piece(&self, block: BlockIndex) -> PieceIndex {
        PieceIndex(block.0 / self.blocks_per_piece)
    }

    /// Returns how many blocks `piece` is split into.
    pub fn piece_block_count(&self, piece: PieceIndex) -> u32 {
        if self.is_last_piece(piece) {
            self.blocks_in_last_piece
        } else {
            self.blocks_per_piece
        }
    }

    /// Returns the byte length of `piece`.
    pub fn piece_byte_length(&self, piece: PieceIndex) -> u32 {
        if self.is_last_piece(piece) {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    /// Returns the byte length of `block`.
    pub fn block_byte_length(&self, block: BlockIndex) -> u32 {
        if block.0 == self.block_count - 1 {
            self.last_block_length
        } else {
            self.block_length
        }
    }

    /// Returns the block holding byte `offset` of `piece`.
    pub fn block_index(&self, piece: PieceIndex, offset: u32) -> BlockIndex {
        BlockIndex(self.piece_first_block(piece).0 + offset / self.block_length)
    }

    /// Returns the absolute torrent byte offset of byte `offset` within `piece`.
    pub fn byte_offset(&self, piece: PieceIndex, offset: u32) -> u64 {
        u64::from(piece.0) * u64::from(self.piece_length) + u64::from(offset)
    }

    /// Checks a peer-supplied request triple against the real torrent layout.
    ///
    /// # Errors
    ///
    /// - `RequestRejection::PieceOutOfRange` - If `piece` is past the last piece
    /// - `RequestRejection::ZeroLength` - If `length` is zero
    /// - `RequestRejection::OutOfBounds` - If the range runs past the end of the piece
    pub fn validate_request(
        &self,
        piece: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), RequestRejection> {
        if piece.0 >= self.piece_count {
            return Err(RequestRejection::PieceOutOfRange {
                piece,
                piece_count: self.piece_count,
            });
        }

        if length == 0 {
            return Err(RequestRejection::ZeroLength);
        }

        let piece_length = self.piece_byte_length(piece);
        if u64::from(offset) + u64::from(length) > u64::from(piece_length) {
            return Err(RequestRejection::OutOfBounds {
                offset,
                length,
                piece_length,
            });
        }

        Ok(())
    }

    /// Returns true if the request lies entirely within `piece`.
    pub fn is_request_valid(&self, piece: PieceIndex, offset: u32, length: u32) -> bool {
        match self.validate_request(piece, offset, length) {
            Ok(()) => true,
            Err(rejection) => {
                tracing::debug!(
                    "Rejected peer request piece={} offset={} length={}: {}",
                    piece,
                    offset,
                    length,
                    rejection
                );
                false
            }
        }
    }

    fn is_last_piece(&self, piece: PieceIndex) -> bool {
        piece.0 == self.piece_count - 1
    }
}

fn count_units(total_size: u64, unit: u32) -> Result<u32, TorrentError> {
    u32::try_from(total_size.div_ceil(u64::from(unit))).map_err(|_| {
        TorrentError::InvalidGeometry {
            reason: format!("{total_size} bytes in units of {unit} overflows the index range"),
        }
    })
}
