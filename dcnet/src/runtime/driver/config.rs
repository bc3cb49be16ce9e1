//! Driver configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::{Endpoint, Protocol};

use super::pool::DEFAULT_POOL_DEPTH;
use super::protocol::{DEFAULT_MAX_PACKET_SIZE, HEADER_SIZE, MAX_PACKET_SIZE};
use super::reassembly::DEFAULT_REASSEMBLY_TIMEOUT;

/// Receive buffer holds this many maximum-size datagrams.
pub const RECV_BUFFER_PACKETS: usize = 300;

/// Send buffer holds this many maximum-size datagrams.
pub const SEND_BUFFER_PACKETS: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max packet size {0} must be in ({min}, {max}]", min = HEADER_SIZE, max = MAX_PACKET_SIZE)]
    PacketSize(usize),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid bind address {0:?}")]
    Address(String),
}

/// Configuration for a [`Driver`](super::Driver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Local IP to bind. Empty binds every interface of `protocol`.
    pub bind_address: String,
    /// Local port. Zero lets the OS pick.
    pub port: u16,
    pub protocol: Protocol,
    /// Identifies this process in every header it sends.
    pub sender_id: u32,
    /// Largest datagram this side sends and accepts, header included.
    pub max_packet_size: usize,
    /// Incomplete messages older than this are dropped.
    pub reassembly_timeout: Duration,
    /// Scratch buffers per reassembler.
    pub pool_depth: usize,
    /// Longest the receive thread blocks before rechecking its stop flag.
    pub receive_timeout: Duration,
    /// Received packets buffered between the receive and process threads.
    pub packet_queue_capacity: usize,
    /// Outbound frames buffered before the oldest is dropped.
    pub send_queue_capacity: usize,
    pub event_capacity: usize,
    /// Peers silent for longer than this are disconnected.
    pub session_timeout: Duration,
    /// Stamp a CRC32 on every outbound datagram.
    pub checksum: bool,
    /// Reject inbound datagrams that carry no checksum.
    pub require_checksum: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            bind_address: String::new(),
            port: 0,
            protocol: Protocol::Ipv4,
            sender_id: rand::random(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            pool_depth: DEFAULT_POOL_DEPTH,
            receive_timeout: Duration::from_millis(100),
            packet_queue_capacity: 2000,
            send_queue_capacity: 1000,
            event_capacity: 4096,
            session_timeout: Duration::from_secs(10),
            checksum: true,
            require_checksum: false,
        }
    }
}

impl DriverConfig {
    /// Bind endpoint for the receive socket.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Address`] if `bind_address` is not an IP.
    pub fn bind_endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::resolve(&self.bind_address, self.port, self.protocol)
            .map_err(|_| ConfigError::Address(self.bind_address.clone()))
    }

    /// # Errors
    ///
    /// Returns the first nonsensical setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_packet_size <= HEADER_SIZE || self.max_packet_size > MAX_PACKET_SIZE {
            return Err(ConfigError::PacketSize(self.max_packet_size));
        }
        let non_zero = [
            ("pool_depth", self.pool_depth),
            ("packet_queue_capacity", self.packet_queue_capacity),
            ("send_queue_capacity", self.send_queue_capacity),
            ("event_capacity", self.event_capacity),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.receive_timeout.is_zero() {
            return Err(ConfigError::Zero("receive_timeout"));
        }
        if self.reassembly_timeout.is_zero() {
            return Err(ConfigError::Zero("reassembly_timeout"));
        }
        self.bind_endpoint()?;
        Ok(())
    }

    #[must_use]
    pub const fn recv_buffer_size(&self) -> usize {
        self.max_packet_size * RECV_BUFFER_PACKETS
    }

    #[must_use]
    pub const fn send_buffer_size(&self) -> usize {
        self.max_packet_size * SEND_BUFFER_PACKETS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DriverConfig::default();
        assert_eq!(config.max_packet_size, 9000);
        assert_eq!(config.pool_depth, 100);
        assert_eq!(config.session_timeout, Duration::from_secs(10));
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.recv_buffer_size(), 2_700_000);
    }

    #[test]
    fn rejects_nonsense() {
        let mut config = DriverConfig {
            max_packet_size: HEADER_SIZE,
            ..DriverConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PacketSize(HEADER_SIZE)));

        config.max_packet_size = 1500;
        config.pool_depth = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("pool_depth")));

        config.pool_depth = 8;
        config.bind_address = "localhost".into();
        assert!(matches!(config.validate(), Err(ConfigError::Address(_))));
    }

    #[test]
    fn config_survives_postcard_encoding() {
        let config: DriverConfig = postcard::from_bytes(
            &postcard::to_stdvec(&DriverConfig {
                port: 8888,
                ..DriverConfig::default()
            })
            .unwrap(),
        )
        .unwrap();
        assert_eq!(config.port, 8888);
        assert!(config.checksum);
    }
}
