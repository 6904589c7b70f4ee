//! Reconnecting an outgoing connection after the remote drops it

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use riptide_transport::network::{EncryptionMode, PeerCipher, PeerIo, PeerIoSession, ReadState};
use riptide_transport::test_fixtures::drive_until;
use riptide_transport::torrent::{InfoHash, PeerId};
use riptide_transport::{RiptideConfig, TorrentError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SECRET: &[u8] = b"reconnect-secret";
const LIMIT: Duration = Duration::from_secs(2);

async fn accept_outgoing(
    session: &Arc<PeerIoSession>,
    listener: &TcpListener,
    hash: InfoHash,
) -> anyhow::Result<(PeerIo, TcpStream)> {
    let (io, accepted) = tokio::join!(
        PeerIo::new_outgoing(session, listener.local_addr()?, hash),
        listener.accept()
    );
    Ok((io?, accepted?.0))
}

/// Sends `plaintext` from the remote end, encrypted with its keystream.
async fn remote_send(
    remote: &mut TcpStream,
    cipher: &mut PeerCipher,
    plaintext: &[u8],
) -> anyhow::Result<()> {
    let mut wire = plaintext.to_vec();
    cipher.encrypt_in_place(&mut wire);
    remote.write_all(&wire).await?;
    Ok(())
}

/// Reads `len` bytes at the remote end and decrypts them.
async fn remote_receive(
    remote: &mut TcpStream,
    cipher: &mut PeerCipher,
    len: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut wire = vec![0u8; len];
    remote.read_exact(&mut wire).await?;
    cipher.decrypt_in_place(&mut wire);
    Ok(wire)
}

async fn send_and_flush(io: &mut PeerIo, plaintext: &[u8]) -> bool {
    let mut message = BytesMut::new();
    io.write_bytes(&mut message, plaintext);
    io.write_buf(&mut message);
    drive_until(io, LIMIT, |io| io.bytes_waiting_to_write() == 0).await
}

#[tokio::test]
async fn test_reconnect_keeps_identity_counters_and_keystream() -> anyhow::Result<()> {
    let session = PeerIoSession::new(RiptideConfig::for_testing());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let hash = InfoHash::new([0x42; 20]);

    let (mut io, mut remote) = accept_outgoing(&session, &listener, hash).await?;

    let peer_id = PeerId::new(*b"-XX0100-abcdefghijkl");
    io.set_peer_id(Some(peer_id));
    io.enable_fast_peers(true);
    io.set_timeout(Duration::from_secs(5));
    io.cipher_mut().init_streams(SECRET)?;
    io.set_encryption(EncryptionMode::Rc4)?;

    let mut mirror = PeerCipher::new(Some(hash), true);
    mirror.init_streams(SECRET)?;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    io.set_io_functions(
        Some(Box::new(move |io, input| {
            let mut bytes = vec![0u8; input.len()];
            io.read_bytes(input, &mut bytes);
            sink.lock().extend_from_slice(&bytes);
            ReadState::More
        })),
        None,
        None,
    );

    // Traffic in both directions before the drop.
    remote_send(&mut remote, &mut mirror, b"have").await?;
    let done = Arc::clone(&received);
    let delivered = drive_until(&mut io, LIMIT, move |_| done.lock().len() == 4).await;
    assert!(delivered);
    assert!(send_and_flush(&mut io, b"ping").await);
    assert_eq!(remote_receive(&mut remote, &mut mirror, 4).await?, b"ping");

    drop(remote);
    let (reconnected, accepted) = tokio::join!(io.reconnect(), listener.accept());
    reconnected?;
    let mut remote = accepted?.0;

    assert!(io.is_connected());
    assert_eq!(io.peer_id(), Some(&peer_id));
    assert!(io.supports_fast_peers());
    assert!(io.is_encrypted());
    assert_eq!(io.timeout(), Duration::from_secs(5));
    assert_eq!(io.bytes_from_peer(), 4);
    assert_eq!(io.bytes_waiting_to_write(), 0);

    // Keystreams continue where they stopped, and callbacks survive.
    assert!(send_and_flush(&mut io, b"pong").await);
    assert_eq!(remote_receive(&mut remote, &mut mirror, 4).await?, b"pong");

    remote_send(&mut remote, &mut mirror, b"unchoke").await?;
    let done = Arc::clone(&received);
    let delivered = drive_until(&mut io, LIMIT, move |_| done.lock().len() == 11).await;
    assert!(delivered);
    assert_eq!(&received.lock()[..], b"haveunchoke");
    assert_eq!(io.bytes_from_peer(), 11);
    Ok(())
}

#[tokio::test]
async fn test_failed_reconnect_leaves_connection_defunct() -> anyhow::Result<()> {
    let session = PeerIoSession::new(RiptideConfig::for_testing());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let hash = InfoHash::new([0x07; 20]);

    let (mut io, remote) = accept_outgoing(&session, &listener, hash).await?;
    drop(remote);
    drop(listener);

    let result = io.reconnect().await;

    assert!(matches!(
        result,
        Err(TorrentError::PeerConnectionError { .. })
    ));
    assert!(!io.is_connected());
    assert!(!io.process_next_event().await);
    Ok(())
}
