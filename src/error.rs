/// Error originating from the IDSCP2 library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("{0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("{0}")]
    Daps(#[from] crate::daps::DapsError),
    #[error("{0}")]
    Ra(#[from] crate::ra::RaError),
    #[error("{0}")]
    Decode(#[from] crate::messages::DecodeError),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("peer closed the session: {0}")]
    PeerClosed(String),
    #[error("not connected")]
    NotConnected,
    #[error("timeout: {0}")]
    Timeout(String),
}
