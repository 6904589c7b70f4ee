//! Request validation at the edges of a torrent with a short tail

use riptide_transport::TorrentGeometry;
use riptide_transport::torrent::{BlockIndex, PieceIndex, RequestRejection};

const PIECE_LENGTH: u32 = 262_144;
const TAIL: u64 = 100_000;

fn geometry() -> TorrentGeometry {
    TorrentGeometry::new(PIECE_LENGTH, 9 * u64::from(PIECE_LENGTH) + TAIL).unwrap()
}

#[test]
fn test_last_piece_request_past_tail_is_rejected() {
    let geometry = geometry();
    let last = PieceIndex::new(geometry.piece_count() - 1);
    let last_len = geometry.last_piece_length();

    assert_eq!(geometry.piece_count(), 10);
    assert_eq!(u64::from(last_len), TAIL);

    assert!(geometry.is_request_valid(last, last_len - 1, 1));
    assert!(!geometry.is_request_valid(last, last_len - 1, 2));
    assert!(matches!(
        geometry.validate_request(last, last_len - 1, 2),
        Err(RequestRejection::OutOfBounds { .. })
    ));
}

#[test]
fn test_full_piece_request_is_valid_everywhere_but_the_tail() {
    let geometry = geometry();

    for piece in 0..geometry.piece_count() - 1 {
        assert!(geometry.is_request_valid(PieceIndex::new(piece), 0, PIECE_LENGTH));
    }
    let last = PieceIndex::new(geometry.piece_count() - 1);
    assert!(!geometry.is_request_valid(last, 0, PIECE_LENGTH));
    assert!(!geometry.is_request_valid(PieceIndex::new(geometry.piece_count()), 0, 1));
}

#[test]
fn test_tail_block_and_offsets() {
    let geometry = geometry();
    let last_block = BlockIndex::new(geometry.block_count() - 1);

    assert_eq!(geometry.block_length(), 16_384);
    assert_eq!(geometry.blocks_per_piece(), 16);
    assert_eq!(geometry.block_count(), 9 * 16 + 7);
    assert_eq!(geometry.block_byte_length(last_block), (TAIL % 16_384) as u32);
    assert_eq!(
        geometry.byte_offset(PieceIndex::new(9), 16_384),
        9 * u64::from(PIECE_LENGTH) + 16_384
    );
    assert_eq!(geometry.block_piece(last_block), PieceIndex::new(9));
}
