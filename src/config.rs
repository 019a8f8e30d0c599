//! Configuration surface of an IDSCP2 endpoint.
//!
//! All knobs carry sensible defaults so a configuration can be built from a
//! handful of fields, deserialized from TOML, or assembled in code. Delay
//! options are expressed in milliseconds to match the deployed option names.

use std::{fmt, fs, io, path::PathBuf, str::FromStr, time::Duration};

use serde::Deserialize;
use thiserror::Error;

/// Error returned while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Ordered connector trust levels carried in the DAT `securityProfile` claim.
///
/// The derived ordering is the acceptance ordinal: a peer profile satisfies a
/// requirement iff it is greater or equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum SecurityProfile {
    Base,
    Trusted,
    TrustedPlus,
}

impl SecurityProfile {
    /// Parse a claim value; both the `idsc:` profile URIs of the deployed
    /// DAPS and the short names are accepted.
    pub fn from_claim(value: &str) -> Option<Self> {
        match value {
            "idsc:BASE_CONNECTOR_SECURITY_PROFILE" | "BASE" => Some(SecurityProfile::Base),
            "idsc:TRUSTED_CONNECTOR_SECURITY_PROFILE" | "TRUSTED" => Some(SecurityProfile::Trusted),
            "idsc:TRUSTED_CONNECTOR_PLUS_SECURITY_PROFILE" | "TRUSTED_PLUS" => {
                Some(SecurityProfile::TrustedPlus)
            }
            _ => None,
        }
    }
}

impl fmt::Display for SecurityProfile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SecurityProfile::Base => write!(f, "BASE"),
            SecurityProfile::Trusted => write!(f, "TRUSTED"),
            SecurityProfile::TrustedPlus => write!(f, "TRUSTED_PLUS"),
        }
    }
}

/// Minimum requirements a peer DAT must satisfy.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SecurityRequirements {
    pub required_security_level: SecurityProfile,
}

/// Where and how to reach the DAPS.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DapsConfig {
    /// Base URL of the DAPS, e.g. `https://daps.aisec.fraunhofer.de`.
    pub url: String,
    /// Fraction (0,1] of a token's validity after which it is re-fetched.
    pub token_renewal_threshold: f64,
    /// Minimum peer security profile; `None` skips the profile check.
    pub security_requirements: Option<SecurityRequirements>,
    /// Timeout for each DAPS HTTP request.
    pub request_timeout_ms: u64,
}

impl Default for DapsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token_renewal_threshold: 0.66,
            security_requirements: None,
            request_timeout_ms: 15_000,
        }
    }
}

/// TLS identity and trust anchors of this endpoint.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file holding the certificate chain, leaf first.
    pub certificate_chain: PathBuf,
    /// PEM file holding the private key (PKCS#8 or PKCS#1).
    pub private_key: PathBuf,
    /// PEM files of trusted root certificates (the truststore).
    pub trusted_roots: Vec<PathBuf>,
    /// Verify the server name against its certificate when connecting.
    pub hostname_verification_enabled: bool,
}

/// Complete configuration of one IDSCP2 endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Idscp2Configuration {
    /// Upper bound on the whole pre-established phase, and on each
    /// DAT-renegotiation phase.
    pub handshake_timeout_delay_ms: u64,
    /// ACK-wait window per outstanding `Data` record; also enables nothing by
    /// itself, see [`Idscp2Configuration::ack_mode`].
    pub ack_timeout_delay_ms: u64,
    /// How often an unacknowledged `Data` record is retransmitted before the
    /// session is closed.
    pub max_ack_retries: u32,
    /// Stop-and-wait acknowledgement mode for `Data` records.
    pub ack_mode: bool,
    /// Inter-attestation period once established.
    pub ra_timeout_delay_ms: u64,
    /// Bound on a verifier re-run during mid-session re-attestation.
    pub verifier_handshake_timeout_delay_ms: u64,
    /// RA suites this endpoint can run as prover, most preferred first.
    pub supported_ra_suites: Vec<String>,
    /// RA suites this endpoint accepts from the peer's prover.
    pub expected_ra_suites: Vec<String>,
    pub daps: DapsConfig,
    pub tls: TlsConfig,
    /// Wrap application payloads in IDS messages; consumed by higher tiers.
    pub use_ids_messages: bool,
}

impl Default for Idscp2Configuration {
    fn default() -> Self {
        Self {
            handshake_timeout_delay_ms: 5_000,
            ack_timeout_delay_ms: 200,
            max_ack_retries: 3,
            ack_mode: false,
            ra_timeout_delay_ms: 3_600_000,
            verifier_handshake_timeout_delay_ms: 5_000,
            supported_ra_suites: Vec::new(),
            expected_ra_suites: Vec::new(),
            daps: DapsConfig::default(),
            tls: TlsConfig::default(),
            use_ids_messages: false,
        }
    }
}

impl Idscp2Configuration {
    /// Load a configuration file from the provided path.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        contents.parse()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_delay_ms)
    }

    pub fn ra_timeout(&self) -> Duration {
        Duration::from_millis(self.ra_timeout_delay_ms)
    }

    pub fn verifier_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.verifier_handshake_timeout_delay_ms)
    }

    /// Validate cross-field constraints; called by the connection factory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.daps.token_renewal_threshold > 0.0 && self.daps.token_renewal_threshold <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "daps.token_renewal_threshold must lie in (0, 1], got {}",
                self.daps.token_renewal_threshold
            )));
        }
        if self.supported_ra_suites.is_empty() {
            return Err(ConfigError::Validation(
                "supported_ra_suites must not be empty".into(),
            ));
        }
        if self.expected_ra_suites.is_empty() {
            return Err(ConfigError::Validation(
                "expected_ra_suites must not be empty".into(),
            ));
        }
        if self.handshake_timeout_delay_ms == 0 {
            return Err(ConfigError::Validation(
                "handshake_timeout_delay_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl FromStr for Idscp2Configuration {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let config: Idscp2Configuration = toml::from_str(input)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_need_suites_to_validate() {
        let mut config = Idscp2Configuration::default();
        assert!(config.validate().is_err());

        config.supported_ra_suites = vec!["Dummy".into()];
        config.expected_ra_suites = vec!["Dummy".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn renewal_threshold_bounds() {
        let mut config = Idscp2Configuration::default();
        config.supported_ra_suites = vec!["Dummy".into()];
        config.expected_ra_suites = vec!["Dummy".into()];

        config.daps.token_renewal_threshold = 0.0;
        assert!(config.validate().is_err());
        config.daps.token_renewal_threshold = 1.2;
        assert!(config.validate().is_err());
        config.daps.token_renewal_threshold = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_from_toml() {
        let config: Idscp2Configuration = r#"
            handshake_timeout_delay_ms = 2500
            ack_mode = true
            supported_ra_suites = ["Dummy"]
            expected_ra_suites = ["Dummy"]

            [daps]
            url = "https://daps.example.org"
            token_renewal_threshold = 0.5

            [tls]
            certificate_chain = "certs/connector.pem"
            private_key = "certs/connector-key.pem"
            trusted_roots = ["certs/root-ca.pem"]
            hostname_verification_enabled = true
        "#
        .parse()
        .unwrap();

        assert_eq!(config.handshake_timeout(), Duration::from_millis(2500));
        assert!(config.ack_mode);
        assert_eq!(config.daps.url, "https://daps.example.org");
        assert_eq!(config.daps.token_renewal_threshold, 0.5);
        assert!(config.tls.hostname_verification_enabled);
    }

    #[test]
    fn security_profile_ordering() {
        assert!(SecurityProfile::Base < SecurityProfile::Trusted);
        assert!(SecurityProfile::Trusted < SecurityProfile::TrustedPlus);
    }

    #[test]
    fn security_profile_claim_forms() {
        assert_eq!(
            SecurityProfile::from_claim("idsc:TRUSTED_CONNECTOR_SECURITY_PROFILE"),
            Some(SecurityProfile::Trusted)
        );
        assert_eq!(
            SecurityProfile::from_claim("BASE"),
            Some(SecurityProfile::Base)
        );
        assert_eq!(SecurityProfile::from_claim("idsc:UNKNOWN"), None);
    }
}
