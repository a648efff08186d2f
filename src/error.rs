/**
 * error.rs
 *
 * Error types shared by the NAT discovery engine and the cable drivers
 */

use std::io;
use thiserror::Error;

/// Errors surfaced by the NAT discovery engine to its owner
#[derive(Debug, Error)]
pub enum NatDiscoveryError {
    #[error("failed to bind NAT discovery listener on UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("error while trying to discover both public & private IPs of endpoint {cable_name:?}, [{public}, {private}]")]
    Discovery {
        cable_name: String,
        public: SendError,
        private: SendError,
    },

    #[error("error while trying to NAT-discover {kind} IP of endpoint {cable_name:?}: {source}")]
    Send {
        cable_name: String,
        kind: &'static str,
        #[source]
        source: SendError,
    },

    #[error("NAT discovery engine has no datagram sender, start() was not called")]
    NotStarted,
}

/// Failure of a single probe send
#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid target address {0:?}")]
    InvalidAddress(String),

    #[error("error marshaling request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("error sending request packet: {0}")]
    Io(#[from] io::Error),

    #[error("the sent UDP packet was smaller than requested, sent={sent}, expected={expected}")]
    ShortWrite { sent: usize, expected: usize },
}

/// Datagrams that cannot be turned into a protocol message
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed NAT discovery message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported NAT discovery protocol version {received}, expected {expected}")]
    VersionMismatch { received: u32, expected: u32 },
}

/// Backend configuration values that fail to parse
#[derive(Debug, Error)]
pub enum EndpointConfigError {
    #[error("invalid boolean {value:?} for backend config key {key:?}")]
    InvalidBool { key: String, value: String },
}

/// Cable driver construction and lifecycle errors
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unsupported backend type - {0}")]
    UnsupportedBackend(String),

    #[error("unsupported {driver} driver for {backend}")]
    UnsupportedDriver { driver: String, backend: String },

    #[error("{0} driver is not yet supported")]
    NotYetSupported(&'static str),

    #[error("endpoint {0:?} was not found reachable by NAT discovery")]
    Unreachable(String),

    #[error("driver used before init()")]
    NotInitialized,
}
