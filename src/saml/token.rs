//! Compact HS256 tokens carrying a JSON payload with expiry and issue time.

use crate::saml::error::{ErrorKind, SamlError};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretSlice};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SECRET_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signing key")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid token ttl")]
    InvalidTtl,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
}

impl TokenHeader {
    fn hs256() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims<T> {
    value: T,
    exp: i64,
    iat: i64,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: DeserializeOwned>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Signs and verifies tokens with a single in-memory secret.
pub struct TokenCodec {
    secret: SecretSlice<u8>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    #[must_use]
    pub fn new(secret: SecretSlice<u8>) -> Self {
        Self { secret }
    }

    /// Codec with a fresh random secret; tokens it signs die with the process.
    #[must_use]
    pub fn random() -> Self {
        let mut secret = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        Self::new(SecretSlice::from(secret))
    }

    /// Sign `value` so that it is valid for `ttl` from now.
    ///
    /// # Errors
    /// Returns `JwtSign` if the payload cannot be serialized or signed.
    pub fn generate<T: Serialize>(&self, value: &T, ttl: Duration) -> Result<String, SamlError> {
        self.encode_at(value, Utc::now().timestamp(), ttl)
            .map_err(|e| SamlError::with_cause(ErrorKind::JwtSign, e))
    }

    /// Verify `token` and return its payload.
    ///
    /// # Errors
    /// Returns `Session` if the token is malformed, forged or expired.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, SamlError> {
        self.decode_at(token, Utc::now().timestamp())
            .map_err(|e| SamlError::with_cause(ErrorKind::Session, e))
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(self.secret.expose_secret()).map_err(|_| TokenError::InvalidKey)
    }

    fn encode_at<T: Serialize>(
        &self,
        value: &T,
        issued_at: i64,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let ttl = i64::try_from(ttl.as_secs()).map_err(|_| TokenError::InvalidTtl)?;
        let claims = Claims {
            value,
            exp: issued_at.saturating_add(ttl),
            iat: issued_at,
        };

        let header_b64 = b64e_json(&TokenHeader::hs256())?;
        let claims_b64 = b64e_json(&claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{signing_input}.{}",
            Base64UrlUnpadded::encode_string(&signature)
        ))
    }

    fn decode_at<T: DeserializeOwned>(&self, token: &str, now: i64) -> Result<T, TokenError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::TokenFormat);
        };

        let header: TokenHeader = b64d_json(header_b64)?;
        if header.alg != "HS256" {
            return Err(TokenError::UnsupportedAlg(header.alg));
        }

        let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
        let mut mac = self.mac()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims: Claims<T> = b64d_json(claims_b64)?;
        if now > claims.exp {
            return Err(TokenError::Expired);
        }

        Ok(claims.value)
    }
}
