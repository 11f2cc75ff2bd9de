use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    #[error("Timed out waiting for a reply")]
    Timeout,

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Address {0} is already in use on the local segment")]
    DuplicateAddress(Ipv4Addr),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Client is stopping")]
    Stopped,
}

impl Error {
    /// Read-deadline expiry, as opposed to a socket failure. Phase retry
    /// logic branches on this.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
