//! Peer connection transport
//!
//! Sockets, stream encryption, buffering and callback dispatch for
//! BitTorrent peer connections.

pub mod buffer_event;
pub mod cipher;
pub mod dispatch;
pub mod peer_io;
pub mod session;
pub mod socket;

pub use buffer_event::{BufferEvent, Direction, TransportError};
pub use cipher::{PeerCipher, Rc4};
pub use dispatch::{CanReadFn, DidWriteFn, GotErrorFn, ReadState};
pub use peer_io::{EncryptionMode, PeerIo};
pub use session::PeerIoSession;
pub use socket::{SocketOpener, TcpSocketOpener};
