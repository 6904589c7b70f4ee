//! Centralized configuration for the Riptide peer transport.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::torrent::MAX_BLOCK_SIZE;

/// Size of a maximal ordinary request message: one block plus the
/// 13-byte piece message header.
pub const READ_HIGH_WATERMARK: usize = MAX_BLOCK_SIZE as usize + 13;

/// Default idle timeout applied to both directions of a peer connection.
pub const PEER_IO_TIMEOUT: Duration = Duration::from_secs(8);

/// Central configuration for all transport components.
#[derive(Debug, Clone, Default)]
pub struct RiptideConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
}

/// Torrent-level parameters used by the geometry layer.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// BitTorrent client identifier
    pub client_id: &'static str,
    /// Largest block requested from or served to a peer
    pub max_block_size: u32,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-RT0001-",
            max_block_size: MAX_BLOCK_SIZE,
        }
    }
}

/// Peer socket configuration.
///
/// Controls connection timeouts and how much input the socket backend
/// buffers before it stops reading.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Idle timeout for reads and writes on an open peer connection
    pub peer_io_timeout: Duration,
    /// Timeout for establishing an outgoing TCP connection
    pub peer_connect_timeout: Duration,
    /// Input bytes buffered before the backend stops reading from the socket
    pub read_high_watermark: usize,
    /// IPv4 type-of-service byte for peer sockets, `None` keeps the OS default
    pub peer_socket_tos: Option<u8>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer_io_timeout: PEER_IO_TIMEOUT,
            peer_connect_timeout: Duration::from_secs(10),
            read_high_watermark: READ_HIGH_WATERMARK,
            peer_socket_tos: None,
        }
    }
}

impl NetworkConfig {
    /// Creates a configuration with short timeouts for loopback tests.
    pub fn for_testing() -> Self {
        Self {
            peer_io_timeout: Duration::from_secs(2),
            peer_connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }
}

impl RiptideConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("RIPTIDE_PEER_IO_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.network.peer_io_timeout = Duration::from_secs(seconds);
        }

        if let Ok(timeout) = std::env::var("RIPTIDE_PEER_CONNECT_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.network.peer_connect_timeout = Duration::from_secs(seconds);
        }

        if let Ok(watermark) = std::env::var("RIPTIDE_READ_HIGH_WATERMARK")
            && let Ok(bytes) = watermark.parse::<usize>()
        {
            config.network.read_high_watermark = bytes;
        }

        if let Ok(tos) = std::env::var("RIPTIDE_PEER_SOCKET_TOS")
            && let Ok(tos) = tos.parse::<u8>()
        {
            config.network.peer_socket_tos = Some(tos);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            network: NetworkConfig::for_testing(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = RiptideConfig::default();

        assert_eq!(config.torrent.client_id, "-RT0001-");
        assert_eq!(config.torrent.max_block_size, 16384);
        assert_eq!(config.network.peer_io_timeout, Duration::from_secs(8));
        assert_eq!(config.network.read_high_watermark, 16384 + 13);
        assert_eq!(config.network.peer_socket_tos, None);
    }

    #[test]
    fn test_config_presets() {
        let testing_config = RiptideConfig::for_testing();
        assert!(testing_config.network.peer_io_timeout < PEER_IO_TIMEOUT);
        assert_eq!(testing_config.network.read_high_watermark, READ_HIGH_WATERMARK);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("RIPTIDE_PEER_IO_TIMEOUT", "30");
            std::env::set_var("RIPTIDE_PEER_CONNECT_TIMEOUT", "not-a-number");
            std::env::set_var("RIPTIDE_READ_HIGH_WATERMARK", "65536");
            std::env::set_var("RIPTIDE_PEER_SOCKET_TOS", "32");
        }

        let config = RiptideConfig::from_env();

        assert_eq!(config.network.peer_io_timeout, Duration::from_secs(30));
        assert_eq!(config.network.peer_connect_timeout, Duration::from_secs(10));
        assert_eq!(config.network.read_high_watermark, 65536);
        assert_eq!(config.network.peer_socket_tos, Some(32));

        // Cleanup
        unsafe {
            std::env::remove_var("RIPTIDE_PEER_IO_TIMEOUT");
            std::env::remove_var("RIPTIDE_PEER_CONNECT_TIMEOUT");
            std::env::remove_var("RIPTIDE_READ_HIGH_WATERMARK");
            std::env::remove_var("RIPTIDE_PEER_SOCKET_TOS");
        }
    }
}
