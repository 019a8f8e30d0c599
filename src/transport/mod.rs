//! Establishing IDSCP2 connections over mutually authenticated TLS 1.3.
//!
//! [`connect`] dials out; [`Idscp2Server`] accepts. Both end up in the same
//! bootstrap: the fresh TLS stream and the peer certificate are wrapped in a
//! [`SecureChannel`], a state machine is wired on top, and the caller gets
//! the connection once the handshake (Hello, DAT verification, bidirectional
//! attestation) has completed.

pub mod error;
mod secure_channel;
mod tls;

pub use error::TransportError;
pub use secure_channel::{SecureChannel, SecureChannelEndpoint};

use std::{net::SocketAddr, sync::Arc};

use rustls_pki_types::ServerName;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{
    config::Idscp2Configuration, connection::Idscp2Connection, daps::DapsDriver, error::Error,
    ra::RaRegistry,
};

/// Dial `host:port` and run the IDSCP2 handshake.
pub async fn connect(
    host: &str,
    port: u16,
    config: Arc<Idscp2Configuration>,
    daps: Arc<dyn DapsDriver>,
    registry: Arc<RaRegistry>,
) -> Result<Idscp2Connection, Error> {
    config.validate()?;

    let tls_config = tls::client_config(&config.tls)?;
    let address = format!("{host}:{port}");

    let tcp = TcpStream::connect(&address)
        .await
        .map_err(|err| TransportError::Connection(address.clone(), err))?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::InvalidAddress(address.clone()))?;

    let stream = TlsConnector::from(Arc::new(tls_config))
        .connect(server_name, tcp)
        .await
        .map_err(|err| TransportError::Connection(address.clone(), err))?;

    let peer_certificate = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec())
        .ok_or(TransportError::MissingPeerCertificate)?;

    tracing::debug!(%address, "TLS connection up, starting IDSCP2");
    let channel = SecureChannel::spawn(stream, address, Some(peer_certificate));
    Idscp2Connection::start(channel, config, daps, registry).await
}

/// Accepts TLS connections and hands out established IDSCP2 sessions.
pub struct Idscp2Server {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Idscp2Connection>,
    acceptor: JoinHandle<()>,
}

impl Idscp2Server {
    /// Bind `address` (e.g. `"0.0.0.0:29292"`) and start accepting. Each
    /// inbound connection runs its handshake on its own task; only sessions
    /// that reach the established state show up in [`accept`](Self::accept).
    pub async fn bind(
        address: &str,
        config: Arc<Idscp2Configuration>,
        daps: Arc<dyn DapsDriver>,
        registry: Arc<RaRegistry>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let server_config = tls::server_config(&config.tls)?;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| TransportError::Connection(address.to_string(), err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| TransportError::Connection(address.to_string(), err))?;
        let tls_acceptor = TlsAcceptor::from(Arc::new(server_config));

        let (connections_tx, incoming) = mpsc::channel(16);
        let acceptor = tokio::spawn(accept_loop(
            listener,
            tls_acceptor,
            config,
            daps,
            registry,
            connections_tx,
        ));

        tracing::info!(%local_addr, "IDSCP2 server listening");
        Ok(Self {
            local_addr,
            incoming,
            acceptor,
        })
    }

    /// The next established connection; `None` after [`close`](Self::close).
    pub async fn accept(&mut self) -> Option<Idscp2Connection> {
        self.incoming.recv().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections. Established connections live on.
    pub fn close(&self) {
        self.acceptor.abort();
    }
}

impl Drop for Idscp2Server {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    config: Arc<Idscp2Configuration>,
    daps: Arc<dyn DapsDriver>,
    registry: Arc<RaRegistry>,
    connections: mpsc::Sender<Idscp2Connection>,
) {
    while let Ok((tcp, peer_addr)) = listener.accept().await {
        let acceptor = acceptor.clone();
        let config = config.clone();
        let daps = daps.clone();
        let registry = registry.clone();
        let connections = connections.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(%peer_addr, "TLS accept failed: {err}");
                    return;
                }
            };

            let Some(peer_certificate) = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec())
            else {
                tracing::warn!(%peer_addr, "peer presented no certificate");
                return;
            };

            let channel =
                SecureChannel::spawn(stream, peer_addr.to_string(), Some(peer_certificate));
            match Idscp2Connection::start(channel, config, daps, registry).await {
                Ok(connection) => {
                    if connections.send(connection).await.is_err() {
                        tracing::debug!("server dropped while a handshake was in flight");
                    }
                }
                Err(err) => tracing::warn!(%peer_addr, "inbound handshake failed: {err}"),
            }
        });
    }
}
