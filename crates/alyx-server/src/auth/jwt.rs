use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::JwtConfig;

/// Access-token claims. The `auth` variable rules see is built from
/// these plus the user's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User id.
    pub sub: String,
    pub email: String,
    pub verified: bool,
    pub role: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

impl AccessClaims {
    /// The `auth` variable rules evaluate against.
    pub fn to_auth_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.sub,
            "email": self.email,
            "verified": self.verified,
            "role": self.role,
            "metadata": self.metadata,
        })
    }
}

/// HS256 signer/verifier over the configured secret.
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    access_ttl: u64,
}

impl JwtKeys {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            access_ttl: config.access_ttl,
        }
    }

    /// Signs an access token; returns `(token, expires_at_unix)`.
    pub fn sign_access(
        &self,
        user_id: &str,
        email: &str,
        verified: bool,
        role: &str,
        metadata: serde_json::Value,
    ) -> Result<(String, i64), jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let exp = now + self.access_ttl as i64;
        let claims = AccessClaims {
            sub: user_id.to_string(),
            email: email.to_string(),
            verified,
            role: role.to_string(),
            metadata,
            iss: self.issuer.clone(),
            iat: now,
            exp,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        Ok((token, exp))
    }

    /// Verifies signature, expiry, and issuer.
    pub fn verify(&self, token: &str) -> Option<AccessClaims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[self.issuer.clone()]);
        decode::<AccessClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .ok()
    }
}

/// An opaque refresh token; only its hash is persisted.
pub fn new_refresh_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
