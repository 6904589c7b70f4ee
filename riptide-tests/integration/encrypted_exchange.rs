//! Two peer connections exchanging an RC4-encrypted handshake over loopback

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use riptide_transport::RiptideConfig;
use riptide_transport::network::{EncryptionMode, PeerIo, PeerIoSession, ReadState};
use riptide_transport::test_fixtures::drive_until;
use riptide_transport::torrent::{InfoHash, PeerId};
use tokio::net::TcpListener;

const SECRET: &[u8] = b"negotiated-dh-secret";
const HANDSHAKE_LEN: usize = 20;
const LIMIT: Duration = Duration::from_secs(2);

async fn connected_pair(
    session: &Arc<PeerIoSession>,
    hash: InfoHash,
) -> anyhow::Result<(PeerIo, PeerIo)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;

    let (outgoing, accepted) = tokio::join!(
        PeerIo::new_outgoing(session, address, hash),
        listener.accept()
    );
    let (stream, remote_address) = accepted?;
    let incoming = PeerIo::new_incoming(session, remote_address, stream);

    Ok((outgoing?, incoming))
}

fn enable_rc4(io: &mut PeerIo, hash: InfoHash) -> anyhow::Result<()> {
    io.set_torrent_hash(hash);
    io.cipher_mut().init_streams(SECRET)?;
    io.set_encryption(EncryptionMode::Rc4)?;
    Ok(())
}

#[tokio::test]
async fn test_encrypted_handshake_arrives_as_plaintext() -> anyhow::Result<()> {
    let session = PeerIoSession::new(RiptideConfig::for_testing());
    let hash = InfoHash::new([0x5a; 20]);
    let (mut outgoing, mut incoming) = connected_pair(&session, hash).await?;

    enable_rc4(&mut outgoing, hash)?;
    enable_rc4(&mut incoming, hash)?;

    let received = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&received);
    incoming.set_io_functions(
        Some(Box::new(move |io, input| {
            if input.len() < HANDSHAKE_LEN {
                return ReadState::More;
            }
            let mut handshake = [0u8; HANDSHAKE_LEN];
            io.read_bytes(input, &mut handshake);
            *sink.lock() = Some(handshake);
            ReadState::Done
        })),
        None,
        None,
    );

    let peer_id = PeerId::generate("-RT0001-");
    let mut message = BytesMut::new();
    outgoing.write_bytes(&mut message, peer_id.as_bytes());
    assert_ne!(&message[..], peer_id.as_bytes());
    outgoing.write_buf(&mut message);

    let flushed = drive_until(&mut outgoing, LIMIT, |io| io.bytes_waiting_to_write() == 0).await;
    assert!(flushed);

    let done = Arc::clone(&received);
    let delivered = drive_until(&mut incoming, LIMIT, move |_| done.lock().is_some()).await;
    assert!(delivered);

    assert_eq!(received.lock().as_ref(), Some(peer_id.as_bytes()));
    assert_eq!(incoming.bytes_from_peer(), HANDSHAKE_LEN as u64);
    Ok(())
}

#[tokio::test]
async fn test_plaintext_integers_cross_the_wire() -> anyhow::Result<()> {
    let session = PeerIoSession::new(RiptideConfig::for_testing());
    let hash = InfoHash::new([0x11; 20]);
    let (mut outgoing, mut incoming) = connected_pair(&session, hash).await?;

    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&values);
    incoming.set_io_functions(
        Some(Box::new(move |io, input| {
            if input.len() < 7 {
                return ReadState::More;
            }
            let header = io.read_u32(input);
            let kind = io.read_u8(input);
            let port = io.read_u16(input);
            sink.lock().push((header, kind, port));
            ReadState::Again
        })),
        None,
        None,
    );

    let mut message = BytesMut::new();
    outgoing.write_u32(&mut message, u32::MAX);
    outgoing.write_u8(&mut message, 0);
    outgoing.write_u16(&mut message, 6881);
    outgoing.write_u32(&mut message, 0);
    outgoing.write_u8(&mut message, u8::MAX);
    outgoing.write_u16(&mut message, u16::MAX);
    outgoing.write_buf(&mut message);

    let flushed = drive_until(&mut outgoing, LIMIT, |io| io.bytes_waiting_to_write() == 0).await;
    assert!(flushed);
    let done = Arc::clone(&values);
    let delivered = drive_until(&mut incoming, LIMIT, move |_| done.lock().len() == 2).await;
    assert!(delivered);

    assert_eq!(&values.lock()[..], &[(u32::MAX, 0, 6881), (0, u8::MAX, u16::MAX)]);
    assert_eq!(incoming.bytes_from_peer(), 14);
    Ok(())
}
