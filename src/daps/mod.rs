//! Acquisition and verification of Dynamic Attribute Tokens.
//!
//! A [`DapsClient`] talks to a DAPS over HTTPS: it discovers the token and
//! JWKS endpoints from the authorization-server metadata document, requests
//! DATs with an RS256 client assertion, caches the current token until its
//! renewal threshold, and verifies peer DATs against the published JWKS and
//! the peer's TLS certificate fingerprint.
//!
//! The [`DapsDriver`] trait is the seam the state machine depends on; tests
//! substitute an in-memory driver.

pub mod error;
mod jwks;

pub use error::DapsError;
pub use jwks::{Jwk, JwkSet};

use std::{
    fs,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::{
    pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use rustls_pki_types::{pem::PemObject, CertificateDer};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use x509_cert::{
    der::{oid::AssociatedOid, Decode},
    ext::pkix::{AuthorityKeyIdentifier, SubjectKeyIdentifier},
    Certificate,
};

use crate::config::{DapsConfig, SecurityProfile, SecurityRequirements, TlsConfig};

/// Audience requested for our own tokens.
const TARGET_AUDIENCE: &str = "idsc:IDS_CONNECTORS_ALL";
/// Audiences accepted on peer tokens. Deployed DAPS instances have issued
/// both forms; the set must not be narrowed.
const ACCEPTED_AUDIENCES: &[&str] = &["idsc:IDS_CONNECTORS_ALL", "IDS_Connector"];
const TOKEN_SCOPE: &str = "idsc:IDS_CONNECTOR_ATTRIBUTES_ALL";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
/// Lifetime of the client assertion we sign for the token request.
const ASSERTION_VALIDITY_SECS: u64 = 86_400;
/// Clock-skew leeway applied to `exp` and `nbf`.
const LEEWAY_SECS: u64 = 30;
/// Metadata cache lifetime when the DAPS sends no `max-age`, and for the
/// fallback endpoints synthesized on a 404.
const META_FALLBACK_TTL: Duration = Duration::from_secs(86_400);

/// Provider of the local DAT and verifier of peer DATs.
#[async_trait]
pub trait DapsDriver: Send + Sync {
    /// Return the current DAT for this connector, fetching a fresh one when
    /// the cached token has crossed its renewal threshold.
    async fn request_token(&self) -> Result<Vec<u8>, DapsError>;

    /// Verify a peer DAT, binding it to the peer TLS certificate when one is
    /// given. Returns the remaining validity.
    async fn verify_token(
        &self,
        token: &[u8],
        peer_certificate: Option<&[u8]>,
    ) -> Result<Duration, DapsError>;
}

/// Endpoints of a DAPS, from its authorization-server metadata document.
#[derive(Debug, Clone, Deserialize)]
pub struct DapsMeta {
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub issuer: String,
}

struct CachedToken {
    token: Vec<u8>,
    renewal_at: Instant,
}

struct CachedMeta {
    meta: DapsMeta,
    expires_at: Instant,
}

/// HTTP client for one DAPS. Sharing a single instance across connections
/// shares the token, metadata and JWKS caches process-wide.
pub struct DapsClient {
    http: reqwest::Client,
    daps_url: String,
    connector_id: String,
    certificate_der: Vec<u8>,
    signing_key: RsaPrivateKey,
    renewal_threshold: f64,
    requirements: Option<SecurityRequirements>,
    // fair mutex: token requests under burst are served in arrival order
    token: Mutex<Option<CachedToken>>,
    metadata: RwLock<Option<CachedMeta>>,
    jwks: RwLock<JwkSet>,
}

impl DapsClient {
    /// Build a client from the DAPS settings and the local TLS identity; the
    /// certificate yields the connector id and the transport fingerprint, the
    /// private key signs the client assertion (it must be an RSA key).
    pub fn new(daps: &DapsConfig, tls: &TlsConfig) -> Result<Self, DapsError> {
        let certificate = CertificateDer::pem_file_iter(&tls.certificate_chain)
            .map_err(|err| {
                DapsError::Credentials(format!(
                    "cannot read '{}': {err}",
                    tls.certificate_chain.display()
                ))
            })?
            .next()
            .ok_or_else(|| DapsError::Credentials("certificate chain is empty".into()))?
            .map_err(|err| DapsError::Credentials(format!("invalid certificate pem: {err}")))?;

        let key_pem = fs::read_to_string(&tls.private_key).map_err(|err| {
            DapsError::Credentials(format!("cannot read '{}': {err}", tls.private_key.display()))
        })?;
        let signing_key = RsaPrivateKey::from_pkcs8_pem(&key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&key_pem))
            .map_err(|err| DapsError::Credentials(format!("private key is not RSA: {err}")))?;

        let connector_id = connector_identifier(certificate.as_ref())?;
        tracing::debug!(%connector_id, "derived connector identifier");

        url::Url::parse(&daps.url).map_err(|err| {
            DapsError::Credentials(format!("invalid DAPS url '{}': {err}", daps.url))
        })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(daps.request_timeout_ms))
            .build()
            .map_err(|err| DapsError::Http(daps.url.clone(), err))?;

        Ok(Self {
            http,
            daps_url: daps.url.trim_end_matches('/').to_string(),
            connector_id,
            certificate_der: certificate.as_ref().to_vec(),
            signing_key,
            renewal_threshold: daps.token_renewal_threshold,
            requirements: daps.security_requirements,
            token: Mutex::new(None),
            metadata: RwLock::new(None),
            jwks: RwLock::new(JwkSet::default()),
        })
    }

    /// SHA-256 fingerprint of the local certificate, as peers will see it in
    /// our DAT's `transportCertsSha256` claim.
    pub fn local_fingerprint(&self) -> String {
        hex_lower(&Sha256::digest(&self.certificate_der))
    }

    async fn metadata(&self) -> Result<DapsMeta, DapsError> {
        if let Some(cached) = self.metadata.read().await.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.meta.clone());
            }
        }

        let mut slot = self.metadata.write().await;
        // another task may have refreshed while we waited for the write lock
        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.meta.clone());
            }
        }

        let url = format!("{}/.well-known/oauth-authorization-server", self.daps_url);
        tracing::debug!(%url, "fetching DAPS metadata");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| DapsError::Http(url.clone(), err))?;

        let (meta, ttl) = if response.status() == reqwest::StatusCode::NOT_FOUND {
            // older DAPS deployments predate the metadata document
            let meta = DapsMeta {
                token_endpoint: format!("{}/token", self.daps_url),
                jwks_uri: format!("{}/jwks.json", self.daps_url),
                issuer: self.daps_url.clone(),
            };
            (meta, META_FALLBACK_TTL)
        } else {
            let ttl = max_age(&response).unwrap_or(META_FALLBACK_TTL);
            let meta = response
                .error_for_status()
                .map_err(|err| DapsError::Http(url.clone(), err))?
                .json::<DapsMeta>()
                .await
                .map_err(|err| DapsError::Http(url.clone(), err))?;
            (meta, ttl)
        };

        *slot = Some(CachedMeta {
            meta: meta.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(meta)
    }

    async fn refresh_jwks(&self, meta: &DapsMeta) -> Result<(), DapsError> {
        let set = self
            .http
            .get(&meta.jwks_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| DapsError::Http(meta.jwks_uri.clone(), err))?
            .json::<JwkSet>()
            .await
            .map_err(|err| DapsError::Http(meta.jwks_uri.clone(), err))?;

        *self.jwks.write().await = set;
        Ok(())
    }

    /// Resolve the verification key for `kid`, refreshing the JWKS once when
    /// the cached set does not know it (key rollover).
    async fn resolve_key(
        &self,
        meta: &DapsMeta,
        kid: Option<&str>,
    ) -> Result<RsaPublicKey, DapsError> {
        if let Some(jwk) = self.jwks.read().await.find(kid) {
            return jwk.to_rsa_key();
        }

        self.refresh_jwks(meta).await?;

        match self.jwks.read().await.find(kid) {
            Some(jwk) => jwk.to_rsa_key(),
            None => Err(DapsError::invalid(match kid {
                Some(kid) => format!("no JWKS entry for kid '{kid}'"),
                None => "token has no kid and JWKS is not a single RSA key".to_string(),
            })),
        }
    }

    fn client_assertion(&self, now: u64) -> Result<String, DapsError> {
        let header = serde_json::json!({ "alg": "RS256", "typ": "JWT" });
        let claims = serde_json::json!({
            "iss": self.connector_id,
            "sub": self.connector_id,
            "aud": TARGET_AUDIENCE,
            "iat": now,
            "nbf": now,
            "exp": now + ASSERTION_VALIDITY_SECS,
        });

        let signing_input = format!(
            "{}.{}",
            Base64UrlUnpadded::encode_string(header.to_string().as_bytes()),
            Base64UrlUnpadded::encode_string(claims.to_string().as_bytes()),
        );
        let digest = Sha256::digest(signing_input.as_bytes());
        let signature = self
            .signing_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|err| DapsError::Credentials(format!("cannot sign assertion: {err}")))?;

        Ok(format!(
            "{signing_input}.{}",
            Base64UrlUnpadded::encode_string(&signature)
        ))
    }

    async fn fetch_token(&self, meta: &DapsMeta) -> Result<(Vec<u8>, Duration), DapsError> {
        let assertion = self.client_assertion(unix_now())?;
        tracing::info!(endpoint = %meta.token_endpoint, "requesting DAT from DAPS");

        let response = self
            .http
            .post(&meta.token_endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_assertion_type", CLIENT_ASSERTION_TYPE),
                ("client_assertion", assertion.as_str()),
                ("scope", TOKEN_SCOPE),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| DapsError::Http(meta.token_endpoint.clone(), err))?;

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| DapsError::Http(meta.token_endpoint.clone(), err))?;

        let token = match body.get("access_token").and_then(|t| t.as_str()) {
            Some(token) => token.as_bytes().to_vec(),
            None => {
                let detail = body
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("response carries no access_token");
                return Err(DapsError::UnexpectedResponse(
                    meta.token_endpoint.clone(),
                    detail.to_string(),
                ));
            }
        };

        // never hand out a token we could not verify ourselves
        let header = token_header(std::str::from_utf8(&token).map_err(|_| {
            DapsError::UnexpectedResponse(meta.token_endpoint.clone(), "token is not utf-8".into())
        })?)?;
        let key = self.resolve_key(meta, header.kid.as_deref()).await?;
        let validity = verify_with_key(&token, &key, &meta.issuer, unix_now(), None, None)?;

        Ok((token, validity))
    }
}

#[async_trait]
impl DapsDriver for DapsClient {
    async fn request_token(&self) -> Result<Vec<u8>, DapsError> {
        let mut slot = self.token.lock().await;
        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.renewal_at {
                return Ok(cached.token.clone());
            }
        }

        let meta = self.metadata().await?;
        let (token, validity) = self.fetch_token(&meta).await?;
        tracing::debug!(validity_secs = validity.as_secs(), "acquired fresh DAT");

        *slot = Some(CachedToken {
            token: token.clone(),
            renewal_at: Instant::now() + validity.mul_f64(self.renewal_threshold),
        });
        Ok(token)
    }

    async fn verify_token(
        &self,
        token: &[u8],
        peer_certificate: Option<&[u8]>,
    ) -> Result<Duration, DapsError> {
        let meta = self.metadata().await?;
        let token_str = std::str::from_utf8(token)
            .map_err(|_| DapsError::invalid("token is not utf-8"))?;
        let header = token_header(token_str)?;
        let key = self.resolve_key(&meta, header.kid.as_deref()).await?;

        verify_with_key(
            token,
            &key,
            &meta.issuer,
            unix_now(),
            peer_certificate,
            self.requirements.as_ref(),
        )
    }
}

/// Derive the connector identifier from the certificate's subject and
/// authority key identifiers: `SKI ":keyid:" AKI` with upper-case
/// colon-separated hex, keeping the trailing colon of the SKI half.
pub fn connector_identifier(certificate_der: &[u8]) -> Result<String, DapsError> {
    let certificate = Certificate::from_der(certificate_der)
        .map_err(|err| DapsError::Credentials(format!("unparsable certificate: {err}")))?;

    let mut ski = None;
    let mut aki = None;
    for extension in certificate.tbs_certificate.extensions.iter().flatten() {
        if extension.extn_id == SubjectKeyIdentifier::OID {
            let parsed = SubjectKeyIdentifier::from_der(extension.extn_value.as_bytes())
                .map_err(|err| DapsError::Credentials(format!("bad SKI extension: {err}")))?;
            ski = Some(parsed.0.as_bytes().to_vec());
        } else if extension.extn_id == AuthorityKeyIdentifier::OID {
            let parsed = AuthorityKeyIdentifier::from_der(extension.extn_value.as_bytes())
                .map_err(|err| DapsError::Credentials(format!("bad AKI extension: {err}")))?;
            aki = parsed.key_identifier.map(|id| id.as_bytes().to_vec());
        }
    }

    let ski = ski.ok_or_else(|| {
        DapsError::Credentials("certificate carries no SubjectKeyIdentifier".into())
    })?;
    let aki = aki.ok_or_else(|| {
        DapsError::Credentials("certificate carries no AuthorityKeyIdentifier".into())
    })?;

    let ski_hex = colon_hex_upper(&ski);
    let aki_hex = colon_hex_upper(&aki);
    Ok(format!(
        "{ski_hex}keyid:{}",
        aki_hex.trim_end_matches(':')
    ))
}

/// Lower-case hex SHA-256 of a certificate in DER form, the format used in
/// `transportCertsSha256` claims.
pub fn certificate_fingerprint(certificate_der: &[u8]) -> String {
    hex_lower(&Sha256::digest(certificate_der))
}

struct TokenHeader {
    alg: String,
    kid: Option<String>,
}

fn split_token(token: &str) -> Result<(&str, &str, &str), DapsError> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(claims), Some(signature), None) => Ok((header, claims, signature)),
        _ => Err(DapsError::invalid("token is not a three-part JWT")),
    }
}

fn token_header(token: &str) -> Result<TokenHeader, DapsError> {
    #[derive(Deserialize)]
    struct Header {
        alg: String,
        #[serde(default)]
        kid: Option<String>,
    }

    let (header_b64, _, _) = split_token(token)?;
    let header = Base64UrlUnpadded::decode_vec(header_b64)
        .map_err(|_| DapsError::invalid("token header is not base64url"))?;
    let header: Header = serde_json::from_slice(&header)
        .map_err(|_| DapsError::invalid("token header is not valid JSON"))?;
    Ok(TokenHeader {
        alg: header.alg,
        kid: header.kid,
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn iter(&self) -> impl Iterator<Item = &T> {
        match self {
            OneOrMany::One(value) => std::slice::from_ref(value).iter(),
            OneOrMany::Many(values) => values.iter(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    aud: Option<OneOrMany<String>>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    nbf: Option<u64>,
    #[serde(default, rename = "transportCertsSha256")]
    transport_certs_sha256: Option<OneOrMany<String>>,
    #[serde(default, rename = "securityProfile")]
    security_profile: Option<String>,
}

/// Signature and claim validation of a DAT against an already resolved key.
/// Factored out of [`DapsClient`] so it can be exercised without HTTP.
pub(crate) fn verify_with_key(
    token: &[u8],
    key: &RsaPublicKey,
    issuer: &str,
    now: u64,
    peer_certificate: Option<&[u8]>,
    requirements: Option<&SecurityRequirements>,
) -> Result<Duration, DapsError> {
    let token = std::str::from_utf8(token).map_err(|_| DapsError::invalid("token is not utf-8"))?;
    let (header_b64, claims_b64, signature_b64) = split_token(token)?;

    let header = token_header(token)?;
    if header.alg != "RS256" {
        return Err(DapsError::invalid(format!(
            "token algorithm '{}' is not RS256",
            header.alg
        )));
    }

    let signature = Base64UrlUnpadded::decode_vec(signature_b64)
        .map_err(|_| DapsError::invalid("token signature is not base64url"))?;
    let digest = Sha256::digest(format!("{header_b64}.{claims_b64}").as_bytes());
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .map_err(|_| DapsError::invalid("signature verification failed"))?;

    let claims = Base64UrlUnpadded::decode_vec(claims_b64)
        .map_err(|_| DapsError::invalid("token claims are not base64url"))?;
    let claims: DatClaims = serde_json::from_slice(&claims)
        .map_err(|_| DapsError::invalid("token claims are not valid JSON"))?;

    let exp = claims
        .exp
        .ok_or_else(|| DapsError::invalid("token has no expiration time"))?;
    if now >= exp + LEEWAY_SECS {
        return Err(DapsError::invalid("token has expired"));
    }
    if let Some(nbf) = claims.nbf {
        if now + LEEWAY_SECS < nbf {
            return Err(DapsError::invalid("token is not yet valid"));
        }
    }

    match claims.iss.as_deref() {
        Some(iss) if iss == issuer => {}
        Some(iss) => {
            return Err(DapsError::invalid(format!(
                "token issuer '{iss}' does not match '{issuer}'"
            )))
        }
        None => return Err(DapsError::invalid("token has no issuer")),
    }

    if claims.sub.as_deref().unwrap_or("").is_empty() {
        return Err(DapsError::invalid("token has no subject"));
    }

    let audience_ok = claims
        .aud
        .as_ref()
        .map(|aud| aud.iter().any(|a| ACCEPTED_AUDIENCES.contains(&a.as_str())))
        .unwrap_or(false);
    if !audience_ok {
        return Err(DapsError::invalid("token audience is not accepted"));
    }

    if let Some(peer_certificate) = peer_certificate {
        let fingerprint = hex_lower(&Sha256::digest(peer_certificate));
        let bound = claims
            .transport_certs_sha256
            .as_ref()
            .map(|certs| certs.iter().any(|c| c.eq_ignore_ascii_case(&fingerprint)))
            .unwrap_or(false);
        if !bound {
            return Err(DapsError::invalid(
                "token is not bound to the peer's TLS certificate",
            ));
        }
    }

    if let Some(requirements) = requirements {
        let claim = claims
            .security_profile
            .as_deref()
            .ok_or_else(|| DapsError::invalid("token carries no securityProfile"))?;
        let profile = SecurityProfile::from_claim(claim)
            .ok_or_else(|| DapsError::invalid(format!("unknown securityProfile '{claim}'")))?;
        if profile < requirements.required_security_level {
            return Err(DapsError::invalid(format!(
                "securityProfile {profile} is below the required {}",
                requirements.required_security_level
            )));
        }
    }

    Ok(Duration::from_secs(exp.saturating_sub(now)))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn colon_hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}:")).collect()
}

fn max_age(response: &reqwest::Response) -> Option<Duration> {
    let cache_control = response
        .headers()
        .get(reqwest::header::CACHE_CONTROL)?
        .to_str()
        .ok()?;
    cache_control.split(',').find_map(|directive| {
        let secs = directive.trim().strip_prefix("max-age=")?.parse().ok()?;
        Some(Duration::from_secs(secs))
    })
}
