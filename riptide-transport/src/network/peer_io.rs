//! A single peer connection and its byte-level read/write API.
//!
//! [`PeerIo`] owns the socket (through its [`BufferEvent`]), the
//! [`PeerCipher`] and the connection metadata the protocol layer queries.
//! Every read and write goes through the active [`EncryptionMode`], so the
//! protocol layer sees plaintext while the wire carries ciphertext once
//! encryption has been switched on.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tracing::Instrument;

use super::buffer_event::BufferEvent;
use super::cipher::PeerCipher;
use super::dispatch::IoCallbacks;
use super::session::PeerIoSession;
use super::socket::close_socket;
use crate::torrent::{InfoHash, PeerId, TorrentError};
use crate::tracing_setup::peer_span;

/// How bytes are transformed on their way to and from the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMode {
    /// Bytes cross the wire verbatim.
    #[default]
    None,
    /// Bytes are run through the connection's RC4 keystreams.
    Rc4,
}

/// One peer socket association.
pub struct PeerIo {
    pub(super) session: Arc<PeerIoSession>,
    address: SocketAddr,
    is_incoming: bool,
    peer_id: Option<PeerId>,
    extended_protocol_supported: bool,
    fast_peers_supported: bool,
    encryption: EncryptionMode,
    created_at: Instant,
    pub(super) bufev: BufferEvent,
    pub(super) callbacks: IoCallbacks,
    cipher: PeerCipher,
    bytes_from_peer: u64,
    pub(super) span: tracing::Span,
}

impl PeerIo {
    fn new(
        session: &Arc<PeerIoSession>,
        address: SocketAddr,
        torrent_hash: Option<InfoHash>,
        is_incoming: bool,
        stream: TcpStream,
    ) -> Self {
        let config = session.network_config();
        let bufev = BufferEvent::new(stream, config.peer_io_timeout, config.read_high_watermark);

        Self {
            session: Arc::clone(session),
            address,
            is_incoming,
            peer_id: None,
            extended_protocol_supported: false,
            fast_peers_supported: false,
            encryption: EncryptionMode::None,
            created_at: Instant::now(),
            bufev,
            callbacks: IoCallbacks::default(),
            cipher: PeerCipher::new(torrent_hash, is_incoming),
            bytes_from_peer: 0,
            span: peer_span(address, is_incoming),
        }
    }

    /// Connects to `address` and wraps the new socket.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If the socket could not be opened
    pub async fn new_outgoing(
        session: &Arc<PeerIoSession>,
        address: SocketAddr,
        torrent_hash: InfoHash,
    ) -> Result<Self, TorrentError> {
        let stream = session.socket_opener().open_outgoing(address).await?;
        let io = Self::new(session, address, Some(torrent_hash), false, stream);
        io.span.in_scope(|| tracing::debug!("Opened outgoing peer connection"));
        Ok(io)
    }

    /// Wraps a socket accepted by a listener.
    ///
    /// The torrent is unknown until the remote handshake names it.
    pub fn new_incoming(
        session: &Arc<PeerIoSession>,
        address: SocketAddr,
        stream: TcpStream,
    ) -> Self {
        let io = Self::new(session, address, None, true, stream);
        io.span.in_scope(|| tracing::debug!("Accepted incoming peer connection"));
        io
    }

    pub fn session(&self) -> &Arc<PeerIoSession> {
        &self.session
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn is_incoming(&self) -> bool {
        self.is_incoming
    }

    /// Returns true while a live socket is bound.
    pub fn is_connected(&self) -> bool {
        self.bufev.has_socket()
    }

    /// Time elapsed since the connection object was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn age_secs(&self) -> u64 {
        self.age().as_secs()
    }

    /// Remote peer id, once the handshake layer has set it.
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    /// Sets or clears the remote peer id.
    pub fn set_peer_id(&mut self, peer_id: Option<PeerId>) {
        self.peer_id = peer_id;
    }

    /// Records whether the peer supports the extension protocol (LTEP).
    pub fn enable_extended_protocol(&mut self, supported: bool) {
        self.extended_protocol_supported = supported;
    }

    pub fn supports_extended_protocol(&self) -> bool {
        self.extended_protocol_supported
    }

    /// Records whether the peer supports the fast extension (FEXT).
    pub fn enable_fast_peers(&mut self, supported: bool) {
        self.fast_peers_supported = supported;
    }

    pub fn supports_fast_peers(&self) -> bool {
        self.fast_peers_supported
    }

    /// Binds the torrent this connection serves.
    pub fn set_torrent_hash(&mut self, hash: InfoHash) {
        self.cipher.set_torrent_hash(hash);
    }

    pub fn torrent_hash(&self) -> Option<&InfoHash> {
        self.cipher.torrent_hash()
    }

    pub fn has_torrent_hash(&self) -> bool {
        self.cipher.has_torrent_hash()
    }

    pub fn cipher(&self) -> &PeerCipher {
        &self.cipher
    }

    /// Cipher state for the handshake layer to key from the negotiated secret.
    pub fn cipher_mut(&mut self) -> &mut PeerCipher {
        &mut self.cipher
    }

    /// Switches how subsequent reads and writes are transformed.
    ///
    /// # Errors
    ///
    /// - `TorrentError::CipherNotInitialized` - If RC4 is requested before the
    ///   cipher keystreams were initialised
    pub fn set_encryption(&mut self, mode: EncryptionMode) -> Result<(), TorrentError> {
        if mode == EncryptionMode::Rc4 && !self.cipher.is_initialized() {
            return Err(TorrentError::CipherNotInitialized);
        }
        if self.encryption != mode {
            let _entered = self.span.enter();
            tracing::debug!("Encryption {:?} -> {:?}", self.encryption, mode);
        }
        self.encryption = mode;
        Ok(())
    }

    pub fn encryption(&self) -> EncryptionMode {
        self.encryption
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption == EncryptionMode::Rc4
    }

    pub fn timeout(&self) -> Duration {
        self.bufev.timeout()
    }

    /// Re-arms the idle timeout for both directions and re-enables them.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.bufev.set_timeout(timeout);
    }

    /// Total bytes removed from the input buffer, across reconnects.
    pub fn bytes_from_peer(&self) -> u64 {
        self.bytes_from_peer
    }

    /// Queued output bytes the socket has not accepted yet.
    pub fn bytes_waiting_to_write(&self) -> usize {
        self.bufev.output_len()
    }

    /// Queues already-encoded bytes for the socket.
    pub fn write(&mut self, data: &[u8]) {
        self.bufev.write(data);
    }

    /// Queues an assembled message buffer for the socket and empties it.
    pub fn write_buf(&mut self, buf: &mut BytesMut) {
        self.bufev.write(buf);
        buf.clear();
    }

    /// Appends `data` to `out`, encrypted if encryption is active.
    pub fn write_bytes(&mut self, out: &mut BytesMut, data: &[u8]) {
        let start = out.len();
        out.extend_from_slice(data);
        if self.encryption == EncryptionMode::Rc4 {
            self.cipher.encrypt_in_place(&mut out[start..]);
        }
    }

    pub fn write_u8(&mut self, out: &mut BytesMut, value: u8) {
        self.write_bytes(out, &[value]);
    }

    /// Appends `value` in network byte order.
    pub fn write_u16(&mut self, out: &mut BytesMut, value: u16) {
        self.write_bytes(out, &value.to_be_bytes());
    }

    /// Appends `value` in network byte order.
    pub fn write_u32(&mut self, out: &mut BytesMut, value: u32) {
        self.write_bytes(out, &value.to_be_bytes());
    }

    /// Moves `dst.len()` bytes from the front of `input` into `dst`,
    /// counting them as received and decrypting if encryption is active.
    ///
    /// # Panics
    ///
    /// Panics if `input` holds fewer than `dst.len()` bytes; the caller must
    /// wait until enough bytes have arrived.
    pub fn read_bytes(&mut self, input: &mut BytesMut, dst: &mut [u8]) {
        assert_buffered(input, dst.len());

        input.copy_to_slice(dst);
        self.bytes_from_peer += dst.len() as u64;

        if self.encryption == EncryptionMode::Rc4 {
            self.cipher.decrypt_in_place(dst);
        }
    }

    pub fn read_u8(&mut self, input: &mut BytesMut) -> u8 {
        let mut bytes = [0u8; 1];
        self.read_bytes(input, &mut bytes);
        bytes[0]
    }

    /// Reads a network byte order u16.
    pub fn read_u16(&mut self, input: &mut BytesMut) -> u16 {
        let mut bytes = [0u8; 2];
        self.read_bytes(input, &mut bytes);
        u16::from_be_bytes(bytes)
    }

    /// Reads a network byte order u32.
    pub fn read_u32(&mut self, input: &mut BytesMut) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_bytes(input, &mut bytes);
        u32::from_be_bytes(bytes)
    }

    /// Reads and discards `count` bytes.
    ///
    /// Discarded bytes still count as received and still advance the
    /// decrypt keystream.
    ///
    /// # Panics
    ///
    /// Panics if `input` holds fewer than `count` bytes.
    pub fn drain(&mut self, input: &mut BytesMut, count: usize) {
        assert_buffered(input, count);

        let mut discarded = input.split_to(count);
        self.bytes_from_peer += count as u64;

        if self.encryption == EncryptionMode::Rc4 {
            self.cipher.decrypt_in_place(&mut discarded);
        }
    }

    /// Replaces a dropped outgoing socket with a fresh one to the same peer.
    ///
    /// Identity, counters, cipher state and callbacks are kept; the timeout
    /// and read watermark are re-applied to the new socket. On failure the
    /// connection is left without a socket.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If no replacement socket could be opened
    ///
    /// # Panics
    ///
    /// Panics if called on an incoming connection.
    pub async fn reconnect(&mut self) -> Result<(), TorrentError> {
        assert!(
            !self.is_incoming,
            "incoming peer connection {} cannot reconnect",
            self.address
        );

        if let Some(old_stream) = self.bufev.take_stream() {
            close_socket(old_stream).await;
        }

        let timeout = self.bufev.timeout();
        let read_high_watermark = self.bufev.read_high_watermark();

        let opened = self
            .session
            .socket_opener()
            .open_outgoing(self.address)
            .instrument(self.span.clone())
            .await;

        let _entered = self.span.enter();
        match opened {
            Ok(stream) => {
                self.bufev = BufferEvent::new(stream, timeout, read_high_watermark);
                tracing::debug!("Reconnected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Reconnect failed: {}", e);
                Err(e)
            }
        }
    }

    /// Tears the connection down.
    ///
    /// Callbacks are cleared before this returns, so none fire afterwards.
    /// Closing the socket and releasing the buffers and cipher happen later
    /// on the session's event loop.
    pub fn close(mut self) {
        self.clear_io_functions();
        let span = self.span.clone();
        span.in_scope(|| tracing::debug!("Closing peer connection"));

        let session = Arc::clone(&self.session);
        session.run_in_event_loop(
            async move {
                self.bufev.shutdown().await;
                tracing::trace!("Peer connection torn down");
            }
            .instrument(span),
        );
    }
}

fn assert_buffered(input: &BytesMut, wanted: usize) {
    assert!(
        input.len() >= wanted,
        "peer read of {wanted} bytes with only {} buffered",
        input.len()
    );
}

impl fmt::Display for PeerIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl fmt::Debug for PeerIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIo")
            .field("address", &self.address)
            .field("is_incoming", &self.is_incoming)
            .field("peer_id", &self.peer_id)
            .field("encryption", &self.encryption)
            .field("bytes_from_peer", &self.bytes_from_peer)
            .field("bufev", &self.bufev)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::network::dispatch::ReadState;
    use crate::config::{NetworkConfig, RiptideConfig};
    use crate::test_fixtures::{drive_until, incoming_peer_io};

    const SECRET: &[u8] = b"shared-secret";

    async fn session() -> Arc<PeerIoSession> {
        PeerIoSession::new(RiptideConfig::for_testing())
    }

    /// Keys `io` and a mirror cipher for the remote end of the same connection.
    fn encrypt_with_mirror(io: &mut PeerIo) -> PeerCipher {
        let hash = InfoHash::new([9u8; 20]);
        io.set_torrent_hash(hash);
        io.cipher_mut().init_streams(SECRET).unwrap();
        io.set_encryption(EncryptionMode::Rc4).unwrap();

        let mut mirror = PeerCipher::new(Some(hash), !io.is_incoming());
        mirror.init_streams(SECRET).unwrap();
        mirror
    }

    #[tokio::test]
    async fn test_incoming_connection_metadata() {
        let session = session().await;
        let (io, _remote) = incoming_peer_io(&session).await;

        assert!(io.is_incoming());
        assert!(io.is_connected());
        assert!(!io.has_torrent_hash());
        assert!(io.peer_id().is_none());
        assert!(!io.is_encrypted());
        assert!(!io.supports_extended_protocol());
        assert!(!io.supports_fast_peers());
        assert_eq!(io.bytes_from_peer(), 0);
        assert_eq!(io.timeout(), NetworkConfig::for_testing().peer_io_timeout);
        assert_eq!(io.age_secs(), 0);
        assert_eq!(io.to_string(), io.address().to_string());
    }

    #[tokio::test]
    async fn test_peer_flags_and_id() {
        let session = session().await;
        let (mut io, _remote) = incoming_peer_io(&session).await;

        let peer_id = PeerId::new([4u8; 20]);
        io.set_peer_id(Some(peer_id));
        io.enable_extended_protocol(true);
        io.enable_fast_peers(true);

        assert_eq!(io.peer_id(), Some(&peer_id));
        assert!(io.supports_extended_protocol());
        assert!(io.supports_fast_peers());

        io.set_peer_id(None);
        assert!(io.peer_id().is_none());
    }

    #[tokio::test]
    async fn test_rc4_requires_initialised_cipher() {
        let session = session().await;
        let (mut io, _remote) = incoming_peer_io(&session).await;

        assert!(matches!(
            io.set_encryption(EncryptionMode::Rc4),
            Err(TorrentError::CipherNotInitialized)
        ));
        assert!(!io.is_encrypted());
    }

    #[tokio::test]
    async fn test_plain_integers_are_big_endian() {
        let session = session().await;
        let (mut io, _remote) = incoming_peer_io(&session).await;

        let mut out = BytesMut::new();
        io.write_u8(&mut out, 0x01);
        io.write_u16(&mut out, 0x0203);
        io.write_u32(&mut out, 0x0405_0607);

        assert_eq!(&out[..], &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_integer_extremes_survive_read_back() {
        let session = session().await;
        let (mut io, _remote) = incoming_peer_io(&session).await;

        let mut buf = BytesMut::new();
        for value in [0u8, u8::MAX] {
            io.write_u8(&mut buf, value);
        }
        for value in [0u16, u16::MAX] {
            io.write_u16(&mut buf, value);
        }
        for value in [0u32, u32::MAX] {
            io.write_u32(&mut buf, value);
        }

        assert_eq!(io.read_u8(&mut buf), 0);
        assert_eq!(io.read_u8(&mut buf), u8::MAX);
        assert_eq!(io.read_u16(&mut buf), 0);
        assert_eq!(io.read_u16(&mut buf), u16::MAX);
        assert_eq!(io.read_u32(&mut buf), 0);
        assert_eq!(io.read_u32(&mut buf), u32::MAX);
        assert!(buf.is_empty());
        assert_eq!(io.bytes_from_peer(), 14);
    }

    #[tokio::test]
    async fn test_encrypted_write_matches_remote_keystream() {
        let session = session().await;
        let (mut io, _remote) = incoming_peer_io(&session).await;
        let mut mirror = encrypt_with_mirror(&mut io);

        let mut out = BytesMut::new();
        io.write_bytes(&mut out, b"interested");
        io.write_u32(&mut out, 16384);
        assert_ne!(&out[..10], b"interested");

        mirror.decrypt_in_place(&mut out);
        assert_eq!(&out[..10], b"interested");
        assert_eq!(&out[10..], &16384u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_encrypted_read_decrypts_and_counts() {
        let session = session().await;
        let (mut io, _remote) = incoming_peer_io(&session).await;
        let mut mirror = encrypt_with_mirror(&mut io);

        let mut wire = *b"\x00\x00\x00\x0dpayload";
        mirror.encrypt_in_place(&mut wire);
        let mut input = BytesMut::from(&wire[..]);

        assert_eq!(io.read_u32(&mut input), 13);
        let mut payload = [0u8; 7];
        io.read_bytes(&mut input, &mut payload);

        assert_eq!(&payload, b"payload");
        assert_eq!(io.bytes_from_peer(), 11);
    }

    #[tokio::test]
    async fn test_drain_counts_and_keeps_cipher_in_sync() {
        let session = session().await;
        let (mut io, _remote) = incoming_peer_io(&session).await;
        let mut mirror = encrypt_with_mirror(&mut io);

        let mut wire = *b"skip-me|keep";
        mirror.encrypt_in_place(&mut wire);
        let mut input = BytesMut::from(&wire[..]);

        io.drain(&mut input, 8);
        assert_eq!(io.bytes_from_peer(), 8);

        let mut rest = [0u8; 4];
        io.read_bytes(&mut input, &mut rest);
        assert_eq!(&rest, b"keep");
        assert_eq!(io.bytes_from_peer(), 12);
    }

    #[tokio::test]
    async fn test_drain_matches_read_for_counter() {
        let session = session().await;
        let (mut drained, _a) = incoming_peer_io(&session).await;
        let (mut read, _b) = incoming_peer_io(&session).await;

        let mut input_a = BytesMut::from(&[0u8; 32][..]);
        let mut input_b = BytesMut::from(&[0u8; 32][..]);
        drained.drain(&mut input_a, 20);
        let mut discard = [0u8; 20];
        read.read_bytes(&mut input_b, &mut discard);

        assert_eq!(drained.bytes_from_peer(), read.bytes_from_peer());
        assert_eq!(input_a.len(), input_b.len());
    }

    #[tokio::test]
    #[should_panic(expected = "with only 2 buffered")]
    async fn test_short_read_is_a_contract_violation() {
        let session = session().await;
        let (mut io, _remote) = incoming_peer_io(&session).await;

        let mut input = BytesMut::from(&[1u8, 2][..]);
        io.read_u32(&mut input);
    }

    #[tokio::test]
    #[should_panic(expected = "cannot reconnect")]
    async fn test_incoming_reconnect_is_a_contract_violation() {
        let session = session().await;
        let (mut io, _remote) = incoming_peer_io(&session).await;
        let _ = io.reconnect().await;
    }

    #[tokio::test]
    async fn test_write_buf_queues_and_flushes() {
        let session = session().await;
        let (mut io, mut remote) = incoming_peer_io(&session).await;

        let mut message = BytesMut::new();
        io.write_u32(&mut message, 1);
        io.write_u8(&mut message, 2);
        io.write_buf(&mut message);

        assert!(message.is_empty());
        assert_eq!(io.bytes_waiting_to_write(), 5);

        let flushed = drive_until(&mut io, Duration::from_secs(2), |io| {
            io.bytes_waiting_to_write() == 0
        })
        .await;
        assert!(flushed);

        let mut received = [0u8; 5];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, [0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_set_timeout_updates_backend() {
        let session = session().await;
        let (mut io, _remote) = incoming_peer_io(&session).await;

        io.set_timeout(Duration::from_secs(30));
        assert_eq!(io.timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_close_releases_socket_on_event_loop() {
        let session = session().await;
        let (io, mut remote) = incoming_peer_io(&session).await;

        io.close();

        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), remote.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_close_silences_callbacks_before_teardown() {
        let session = session().await;
        let (mut io, mut remote) = incoming_peer_io(&session).await;
        let reads = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let read_counter = Arc::clone(&reads);
        let error_counter = Arc::clone(&errors);
        io.set_io_functions(
            Some(Box::new(move |io, input| {
                read_counter.fetch_add(1, Ordering::SeqCst);
                let len = input.len();
                io.drain(input, len);
                ReadState::More
            })),
            None,
            Some(Box::new(move |_io, _error| {
                error_counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        io.close();
        // Late traffic from the peer must not reach the closed connection.
        let _ = remote.write_all(b"unchoke").await;

        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), remote.read_to_end(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }
}
