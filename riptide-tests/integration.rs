//! Integration tests for Riptide transport
//!
//! These tests drive real loopback connections through the public API:
//! encrypted exchanges between two peer connections, reconnects that keep
//! connection state, and request validation against torrent geometry.

#[path = "integration/encrypted_exchange.rs"]
mod encrypted_exchange;
#[path = "integration/reconnect.rs"]
mod reconnect;
#[path = "integration/request_validation.rs"]
mod request_validation;
