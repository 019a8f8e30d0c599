//! TLS 1.3 endpoint configuration for IDSCP2 connections.
//!
//! Both roles authenticate with certificates: the server enforces client
//! authentication against the configured trust anchors, the client validates
//! the server chain against the same anchors. Hostname verification can be
//! switched off for deployments whose connector certificates carry no
//! matching SAN; chain validation is never skipped.

use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    client::WebPkiServerVerifier,
    crypto::CryptoProvider,
    server::WebPkiClientVerifier,
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme,
};
use rustls_pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName, UnixTime};

use super::TransportError;
use crate::config::TlsConfig;

pub(super) static CRYPTO_PROVIDER: Lazy<Arc<CryptoProvider>> =
    Lazy::new(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

/// Load the local certificate chain and private key from the configured
/// PEM files.
pub(super) fn load_identity(
    config: &TlsConfig,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    let cert_path = config.certificate_chain.display().to_string();
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(
        &config.certificate_chain,
    )
    .map_err(|_| TransportError::MissingFile(cert_path.clone()))?
    .collect::<Result<Vec<_>, _>>()
    .map_err(|_| TransportError::Certificate(cert_path))?;

    let key = PrivateKeyDer::from_pem_file(&config.private_key)
        .map_err(|_| TransportError::Key(config.private_key.display().to_string()))?;

    Ok((certs, key))
}

/// Build the truststore from the configured root certificate files.
pub(super) fn root_store(config: &TlsConfig) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for path in &config.trusted_roots {
        let display = path.display().to_string();
        let certs = CertificateDer::pem_file_iter(path)
            .map_err(|_| TransportError::MissingFile(display.clone()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| TransportError::Certificate(display.clone()))?;
        for cert in certs {
            roots
                .add(cert)
                .map_err(|_| TransportError::Certificate(display.clone()))?;
        }
    }
    Ok(roots)
}

pub(super) fn client_config(config: &TlsConfig) -> Result<ClientConfig, TransportError> {
    let roots = root_store(config)?;
    let (certs, key) = load_identity(config)?;

    let builder = ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?;

    let client_config = if config.hostname_verification_enabled {
        builder
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?
    } else {
        let verifier = AnyHostnameVerifier::new(roots)?;
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(certs, key)?
    };

    Ok(client_config)
}

pub(super) fn server_config(config: &TlsConfig) -> Result<ServerConfig, TransportError> {
    let roots = root_store(config)?;
    let (certs, key) = load_identity(config)?;

    let client_verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), CRYPTO_PROVIDER.clone())
            .build()
            .map_err(|err| TransportError::ClientVerifier(err.to_string()))?;

    let server_config = ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)?;

    Ok(server_config)
}

/// WebPKI verification with the name check waived. Chain, validity period
/// and signatures are still enforced against the configured roots.
#[derive(Debug)]
struct AnyHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl AnyHostnameVerifier {
    fn new(roots: RootCertStore) -> Result<Self, TransportError> {
        let inner =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), CRYPTO_PROVIDER.clone())
                .build()
                .map_err(|err| TransportError::ClientVerifier(err.to_string()))?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for AnyHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
