//! # Echotrap Auth
//!
//! Stateless session tokens: a subdomain claim signed under the single
//! shared HMAC secret. Tokens are bearer credentials; nothing is persisted
//! and there is no replay cache.
//!
//! A token is valid when it verifies under HS256, carries a `subdomain`
//! claim that satisfies the configured grammar exactly, and its `exp` (when
//! present) lies in the future.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use echotrap_core::{subdomain, EchotrapConfig, Error, Result};

/// Lifetime of minted tokens. Deliberately longer than the per-subdomain key
/// TTL: a returning dashboard re-seeds expired state on next use.
const TOKEN_VALIDITY_DAYS: i64 = 31;

/// Claims carried by a session token.
#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    subdomain: String,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// Issues and verifies session tokens for one deployment secret.
#[derive(Clone)]
pub struct TokenAuthority {
    config: Arc<EchotrapConfig>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenAuthority {
    pub fn new(config: Arc<EchotrapConfig>) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            config,
        }
    }

    /// Issue a token for a freshly minted subdomain.
    pub fn issue(&self, sub: &str) -> Result<String> {
        let now = Utc::now();
        let claims = SessionClaims {
            subdomain: sub.to_string(),
            iat: now.timestamp(),
            exp: Some((now + Duration::days(TOKEN_VALIDITY_DAYS)).timestamp()),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| Error::Auth(format!("failed to sign token: {}", e)))
    }

    /// Verify a token and return its subdomain.
    pub fn verify(&self, token: &str) -> Result<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is optional on the wire but validated when present.
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = true;

        let data = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|_| Error::Auth("Invalid token".to_string()))?;

        let sub = data.claims.subdomain;
        if !subdomain::is_valid(
            &sub,
            &self.config.subdomain_alphabet,
            self.config.subdomain_length,
        ) {
            return Err(Error::Auth("Invalid token".to_string()));
        }
        Ok(sub)
    }
}
