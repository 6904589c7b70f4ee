//! Per-connection RC4 stream cipher state.
//!
//! The handshake layer negotiates a shared secret; this module turns that
//! secret plus the torrent hash into one keystream per direction. Both
//! keystreams advance by exactly the number of bytes processed, so bytes must
//! pass through in wire order or the stream desynchronises for good.

use sha1::{Digest, Sha1};

use crate::torrent::{InfoHash, TorrentError};

/// Keystream bytes thrown away after keying, as message stream encryption requires.
const DISCARDED_KEYSTREAM_BYTES: usize = 1024;

/// RC4 keystream generator.
#[derive(Clone)]
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    /// Runs the key schedule for `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty.
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty(), "RC4 key must not be empty");

        let mut state = [0u8; 256];
        for (i, val) in state.iter_mut().enumerate() {
            *val = i as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }

        Self { state, i: 0, j: 0 }
    }

    /// XORs the next `data.len()` keystream bytes into `data`.
    pub fn process(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte ^= self.next_byte();
        }
    }

    /// Advances the keystream by `count` bytes.
    pub fn discard(&mut self, count: usize) {
        for _ in 0..count {
            self.next_byte();
        }
    }

    fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        let index = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
        self.state[index as usize]
    }
}

impl std::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rc4").finish_non_exhaustive()
    }
}

/// Encrypt/decrypt state owned by one peer connection.
///
/// A connection may exist before its torrent is known (incoming connections
/// learn it from the handshake), so the torrent hash is optional until
/// [`PeerCipher::set_torrent_hash`] binds it.
#[derive(Debug, Clone)]
pub struct PeerCipher {
    torrent_hash: Option<InfoHash>,
    is_incoming: bool,
    encrypt_stream: Option<Rc4>,
    decrypt_stream: Option<Rc4>,
}

impl PeerCipher {
    pub fn new(torrent_hash: Option<InfoHash>, is_incoming: bool) -> Self {
        Self {
            torrent_hash,
            is_incoming,
            encrypt_stream: None,
            decrypt_stream: None,
        }
    }

    /// Binds the torrent hash used by the next [`PeerCipher::init_streams`].
    ///
    /// Keystreams that are already running are left untouched.
    pub fn set_torrent_hash(&mut self, hash: InfoHash) {
        self.torrent_hash = Some(hash);
    }

    pub fn torrent_hash(&self) -> Option<&InfoHash> {
        self.torrent_hash.as_ref()
    }

    pub fn has_torrent_hash(&self) -> bool {
        self.torrent_hash.is_some()
    }

    pub fn is_incoming(&self) -> bool {
        self.is_incoming
    }

    /// Keys both directions from the negotiated secret and the torrent hash.
    ///
    /// The connecting side encrypts with `keyA` and decrypts with `keyB`; the
    /// accepting side does the opposite, so both ends agree on each stream.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MissingTorrentHash` - If no torrent hash is bound yet
    pub fn init_streams(&mut self, shared_secret: &[u8]) -> Result<(), TorrentError> {
        let hash = self.torrent_hash.ok_or(TorrentError::MissingTorrentHash)?;

        let (encrypt_name, decrypt_name): (&[u8], &[u8]) = if self.is_incoming {
            (b"keyB", b"keyA")
        } else {
            (b"keyA", b"keyB")
        };

        self.encrypt_stream = Some(keyed_stream(encrypt_name, shared_secret, &hash));
        self.decrypt_stream = Some(keyed_stream(decrypt_name, shared_secret, &hash));
        Ok(())
    }

    /// Returns true once both keystreams are running.
    pub fn is_initialized(&self) -> bool {
        self.encrypt_stream.is_some() && self.decrypt_stream.is_some()
    }

    /// Encrypts `input` into `output`, advancing the outgoing keystream.
    ///
    /// # Panics
    ///
    /// Panics if the keystreams are not initialised or the slices differ in length.
    pub fn encrypt(&mut self, input: &[u8], output: &mut [u8]) {
        assert_eq!(input.len(), output.len(), "cipher buffers must match");
        output.copy_from_slice(input);
        self.encrypt_in_place(output);
    }

    /// Encrypts `data` in place, advancing the outgoing keystream.
    ///
    /// # Panics
    ///
    /// Panics if the keystreams are not initialised.
    pub fn encrypt_in_place(&mut self, data: &mut [u8]) {
        match self.encrypt_stream.as_mut() {
            Some(stream) => stream.process(data),
            None => panic!("encrypt called before the cipher streams were initialised"),
        }
    }

    /// Decrypts `data` in place, advancing the incoming keystream.
    ///
    /// # Panics
    ///
    /// Panics if the keystreams are not initialised.
    pub fn decrypt_in_place(&mut self, data: &mut [u8]) {
        match self.decrypt_stream.as_mut() {
            Some(stream) => stream.process(data),
            None => panic!("decrypt called before the cipher streams were initialised"),
        }
    }
}

fn keyed_stream(name: &[u8], shared_secret: &[u8], hash: &InfoHash) -> Rc4 {
    let key = Sha1::new()
        .chain_update(name)
        .chain_update(shared_secret)
        .chain_update(hash.as_bytes())
        .finalize();

    let mut stream = Rc4::new(&key);
    stream.discard(DISCARDED_KEYSTREAM_BYTES);
    stream
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"negotiated-diffie-hellman-secret";

    fn cipher_pair() -> (PeerCipher, PeerCipher) {
        let hash = InfoHash::new([7u8; 20]);
        let mut outgoing = PeerCipher::new(Some(hash), false);
        let mut incoming = PeerCipher::new(Some(hash), true);
        outgoing.init_streams(SECRET).unwrap();
        incoming.init_streams(SECRET).unwrap();
        (outgoing, incoming)
    }

    #[test]
    fn test_rc4_known_vector() {
        // "Key" / "Plaintext" from the RC4 reference vectors.
        let mut data = *b"Plaintext";
        Rc4::new(b"Key").process(&mut data);
        assert_eq!(data, [0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]);
    }

    #[test]
    fn test_discard_matches_processing() {
        let mut skipped = Rc4::new(b"secret");
        skipped.discard(10);
        let mut processed = Rc4::new(b"secret");
        processed.process(&mut [0u8; 10]);

        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        skipped.process(&mut a);
        processed.process(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_directions_are_symmetric() {
        let (mut outgoing, mut incoming) = cipher_pair();

        let plaintext = b"BitTorrent protocol handshake";
        let mut wire = vec![0u8; plaintext.len()];
        outgoing.encrypt(plaintext, &mut wire);
        assert_ne!(&wire[..], &plaintext[..]);

        incoming.decrypt_in_place(&mut wire);
        assert_eq!(&wire[..], &plaintext[..]);

        let mut reply = *b"reply";
        incoming.encrypt_in_place(&mut reply);
        outgoing.decrypt_in_place(&mut reply);
        assert_eq!(&reply, b"reply");
    }

    #[test]
    fn test_keystream_advances_across_calls() {
        let (_, mut whole_cipher) = cipher_pair();
        let mut whole = *b"abcdefgh";
        whole_cipher.encrypt_in_place(&mut whole);

        let (_, mut split_cipher) = cipher_pair();
        let mut split = *b"abcdefgh";
        split_cipher.encrypt_in_place(&mut split[..3]);
        split_cipher.encrypt_in_place(&mut split[3..]);

        assert_eq!(whole, split);
    }

    #[test]
    fn test_skipped_bytes_desynchronise() {
        let (mut outgoing, mut incoming) = cipher_pair();

        let mut lost = *b"lost";
        outgoing.encrypt_in_place(&mut lost);

        let mut next = *b"next";
        outgoing.encrypt_in_place(&mut next);
        incoming.decrypt_in_place(&mut next);
        assert_ne!(&next, b"next");
    }

    #[test]
    fn test_init_requires_torrent_hash() {
        let mut cipher = PeerCipher::new(None, true);
        assert!(!cipher.has_torrent_hash());
        assert!(matches!(
            cipher.init_streams(SECRET),
            Err(TorrentError::MissingTorrentHash)
        ));

        let hash = InfoHash::new([3u8; 20]);
        cipher.set_torrent_hash(hash);
        assert_eq!(cipher.torrent_hash(), Some(&hash));
        assert!(cipher.init_streams(SECRET).is_ok());
        assert!(cipher.is_initialized());
    }

    #[test]
    fn test_different_torrents_produce_different_streams() {
        let mut a = PeerCipher::new(Some(InfoHash::new([1u8; 20])), false);
        let mut b = PeerCipher::new(Some(InfoHash::new([2u8; 20])), false);
        a.init_streams(SECRET).unwrap();
        b.init_streams(SECRET).unwrap();

        let mut x = [0u8; 16];
        let mut y = [0u8; 16];
        a.encrypt_in_place(&mut x);
        b.encrypt_in_place(&mut y);
        assert_ne!(x, y);
    }

    #[test]
    #[should_panic(expected = "before the cipher streams were initialised")]
    fn test_encrypt_without_keys_panics() {
        let mut cipher = PeerCipher::new(Some(InfoHash::new([0u8; 20])), false);
        cipher.encrypt_in_place(&mut [0u8; 4]);
    }
}
