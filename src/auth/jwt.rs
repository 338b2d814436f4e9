//! RS256 access-token verification.

use anyhow::{Context, Result};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried on PlayGrid access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub role: String,
    pub exp: usize,
}

impl Claims {
    /// The user id: `uid` when present, falling back to the subject.
    pub fn user_id(&self) -> &str {
        if self.uid.is_empty() {
            &self.sub
        } else {
            &self.uid
        }
    }
}

/// Verifies RS256 tokens emitted by the identity service against its
/// published public key.
pub struct TokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn from_pem_file(public_key_path: &str, issuer: &str) -> Result<Self> {
        let pem = std::fs::read(public_key_path)
            .with_context(|| format!("read JWT public key at {public_key_path}"))?;
        Self::from_pem(&pem, issuer)
    }

    pub fn from_pem(pem: &[u8], issuer: &str) -> Result<Self> {
        let decoding_key =
            DecodingKey::from_rsa_pem(pem).context("parse RSA public key PEM")?;
        let mut validation = Validation::new(Algorithm::RS256);
        if !issuer.is_empty() {
            validation.set_issuer(&[issuer]);
        }
        Ok(Self {
            decoding_key,
            validation,
        })
    }

    pub fn validate(&self, token: &str) -> Result<Claims> {
        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("missing bearer token");
        }
        let decoded = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .context("invalid or expired token")?;
        let claims = decoded.claims;
        if claims.user_id().is_empty() {
            anyhow::bail!("user id missing in token");
        }
        Ok(claims)
    }

    /// Extract and validate a token from an `Authorization` header value.
    pub fn from_header(&self, header: &str) -> Result<Claims> {
        let token = header
            .trim()
            .strip_prefix("Bearer ")
            .unwrap_or(header.trim());
        self.validate(token)
    }
}
