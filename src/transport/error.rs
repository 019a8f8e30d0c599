#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connection to '{0}' failed: {1}")]
    Connection(String, #[source] std::io::Error),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("missing TLS certificate or key file '{0}'")]
    MissingFile(String),
    #[error("invalid TLS certificate in '{0}'")]
    Certificate(String),
    #[error("invalid TLS key '{0}'")]
    Key(String),
    #[error("{0}")]
    Tls(#[from] rustls::Error),
    #[error("client certificate verification cannot be configured: {0}")]
    ClientVerifier(String),
    #[error("peer presented no certificate")]
    MissingPeerCertificate,
    #[error("secure channel closed: {0}")]
    ChannelClosed(String),
}
