//! Error types for the DHCP server and allocation engine

use provision_store::StoreError;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Everything that can go wrong while serving a packet
#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("cannot bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The datagram is not a usable DHCP message
    #[error("malformed packet: {0}")]
    ParseError(String),

    #[error("cannot encode reply: {0}")]
    EncodeError(String),

    /// An option value that cannot be rendered or converted
    #[error("invalid option {code}: {message}")]
    InvalidOption { code: u8, message: String },

    /// The client must be NAK'ed
    #[error("NAK: {0}")]
    LeaseNak(String),

    /// No lease exists for an address we have authority over
    #[error("NAK: no lease for {0} exists")]
    NoLease(Ipv4Addr),

    /// Object store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("socket error: {0}")]
    SendError(#[from] std::io::Error),

    #[error("invalid DHCP configuration: {0}")]
    ConfigError(String),
}

impl DhcpError {
    /// Whether the client should get an explicit NAK
    pub fn is_nak(&self) -> bool {
        matches!(self, DhcpError::LeaseNak(_) | DhcpError::NoLease(_))
    }
}

pub type Result<T> = std::result::Result<T, DhcpError>;
