//! Bearer session tokens
//!
//! HS256 tokens whose payload carries the subject address, the advisory
//! identity-verified flag, and the originating device. Default lifetime is
//! 24 h with 60 s of clock-skew tolerance on verification.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::types::{CorridorError, Result};

/// Clock skew tolerance in seconds
const LEEWAY_SECS: u64 = 60;

/// Bearer token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Requester address
    pub sub: String,
    /// Advisory identity-verified flag; the registry is the authority
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Issued at, unix seconds
    pub iat: u64,
    /// Expiry, unix seconds
    pub exp: u64,
}

/// Token mint + validator
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    expiry_secs: u64,
}

impl TokenService {
    pub fn new(secret: &str, expiry_secs: u64) -> Self {
        let mut validation = Validation::default();
        validation.leeway = LEEWAY_SECS;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            expiry_secs,
        }
    }

    /// Issue a token; returns (token, expires_in_seconds)
    pub fn issue(
        &self,
        address: &str,
        verified: bool,
        device_id: Option<String>,
    ) -> Result<(String, u64)> {
        let now = chrono::Utc::now().timestamp() as u64;
        let claims = Claims {
            sub: address.to_string(),
            verified,
            device_id,
            iat: now,
            exp: now + self.expiry_secs,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| CorridorError::Internal(format!("token mint: {}", e)))?;
        Ok((token, self.expiry_secs))
    }

    /// Validate a token; `None` on any failure (bad signature, expired)
    pub fn verify(&self, token: &str) -> Option<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .ok()
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn extract_token_from_header(header: Option<&str>) -> Option<&str> {
    header?.strip_prefix("Bearer ").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret", 86_400)
    }

    #[test]
    fn test_issue_and_verify_roundtrip() {
        let svc = service();
        let (token, expires_in) = svc
            .issue(&"ab".repeat(32), true, Some("dev-1".into()))
            .unwrap();
        assert_eq!(expires_in, 86_400);

        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.sub, "ab".repeat(32));
        assert!(claims.verified);
        assert_eq!(claims.device_id.as_deref(), Some("dev-1"));
        assert_eq!(claims.exp - claims.iat, 86_400);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (token, _) = service().issue("addr", false, None).unwrap();
        let other = TokenService::new("other-secret", 86_400);
        assert!(other.verify(&token).is_none());
    }

    #[test]
    fn test_expired_token_rejected() {
        let svc = service();
        let now = chrono::Utc::now().timestamp() as u64;
        // Expired beyond the leeway window
        let claims = Claims {
            sub: "addr".into(),
            verified: false,
            device_id: None,
            iat: now - 7_200,
            exp: now - 3_600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(svc.verify(&token).is_none());
    }

    #[test]
    fn test_extract_token_from_header() {
        assert_eq!(extract_token_from_header(Some("Bearer abc.def")), Some("abc.def"));
        assert_eq!(extract_token_from_header(Some("Basic abc")), None);
        assert_eq!(extract_token_from_header(None), None);
    }

    #[test]
    fn test_malformed_token_rejected() {
        assert!(service().verify("not-a-token").is_none());
    }
}
