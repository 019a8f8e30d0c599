//! Minimal JWKS document model, just enough to resolve the RS256 signing
//! keys a DAPS publishes.

use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::{BigUint, RsaPublicKey};
use serde::Deserialize;

use super::error::DapsError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
}

impl JwkSet {
    /// Resolve the verification key for a token header. Without a `kid` the
    /// set must hold exactly one RSA key, otherwise the match is ambiguous.
    pub fn find(&self, kid: Option<&str>) -> Option<&Jwk> {
        match kid {
            Some(kid) => self
                .keys
                .iter()
                .find(|key| key.kid.as_deref() == Some(kid)),
            None => {
                let mut rsa_keys = self.keys.iter().filter(|key| key.kty == "RSA");
                let first = rsa_keys.next()?;
                rsa_keys.next().is_none().then_some(first)
            }
        }
    }
}

impl Jwk {
    pub fn to_rsa_key(&self) -> Result<RsaPublicKey, DapsError> {
        if self.kty != "RSA" {
            return Err(DapsError::invalid(format!(
                "signing key has type '{}', expected RSA",
                self.kty
            )));
        }
        if let Some(alg) = &self.alg {
            if alg != "RS256" {
                return Err(DapsError::invalid(format!(
                    "signing key declares algorithm '{alg}', expected RS256"
                )));
            }
        }

        let n = self
            .n
            .as_deref()
            .ok_or_else(|| DapsError::invalid("signing key misses modulus"))?;
        let e = self
            .e
            .as_deref()
            .ok_or_else(|| DapsError::invalid("signing key misses exponent"))?;

        let n = Base64UrlUnpadded::decode_vec(n)
            .map_err(|_| DapsError::invalid("signing key modulus is not base64url"))?;
        let e = Base64UrlUnpadded::decode_vec(e)
            .map_err(|_| DapsError::invalid("signing key exponent is not base64url"))?;

        RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
            .map_err(|err| DapsError::invalid(format!("unusable RSA key: {err}")))
    }
}
