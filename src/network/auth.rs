//! JWT Authentication
//!
//! Validates tokens issued by an external auth provider. The server never
//! issues tokens. A validated subject maps to a stable ledger [`UserId`].

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::env_flag;
use crate::game::round::UserId;

/// Role claim value that unlocks admin messages.
pub const ADMIN_ROLE: &str = "admin";

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 secret.
    pub secret: Option<String>,
    /// Skip expiry checks (testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Read `AUTH_ISSUER`, `AUTH_AUDIENCE`, `AUTH_PUBLIC_KEY_PEM`,
    /// `AUTH_SECRET` and `AUTH_SKIP_EXPIRY`.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: env_flag("AUTH_SKIP_EXPIRY", false),
        }
    }

    /// Whether a verification key is present.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims = HashSet::new();

        if let Some(ref issuer) = self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match self.audience {
            Some(ref audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if self.skip_expiry {
            validation.validate_exp = false;
        }
        validation
    }
}

/// Claims we read from provider tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the provider's user id.
    pub sub: String,
    /// Expiry (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Application role.
    #[serde(default)]
    pub role: Option<String>,
}

impl TokenClaims {
    /// Ledger account for this subject. Same subject, same account.
    pub fn user_id(&self) -> UserId {
        derive_user_id(&self.sub)
    }

    /// Whether the token grants admin actions.
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }
}

/// Hash a subject string into a UUID-shaped account id.
pub fn derive_user_id(subject: &str) -> UserId {
    let mut hasher = Sha256::new();
    hasher.update(b"crash-round-user:");
    hasher.update(subject.as_bytes());
    let hash = hasher.finalize();

    let mut id = [0u8; 16];
    id.copy_from_slice(&hash[..16]);
    UserId::from_bytes(id)
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No verification key configured.
    #[error("authentication not configured")]
    NotConfigured,
    /// Malformed token.
    #[error("invalid token format")]
    InvalidFormat,
    /// Signature check failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token expired.
    #[error("token expired")]
    Expired,
    /// Unexpected issuer.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Unexpected audience.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Anything else from the JWT library.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Validate a token and return its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let claims = match (&config.public_key_pem, &config.secret) {
        (Some(pem), _) => {
            let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
            decode::<TokenClaims>(token, &key, &config.validation(Algorithm::RS256))
                .map_err(map_jwt_error)?
                .claims
        }
        (None, Some(secret)) => {
            let key = DecodingKey::from_secret(secret.as_bytes());
            decode::<TokenClaims>(token, &key, &config.validation(Algorithm::HS256))
                .map_err(map_jwt_error)?
                .claims
        }
        (None, None) => return Err(AuthError::NotConfigured),
    };

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    if !config.skip_expiry && claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "crash-round-test-secret-32-bytes";

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn claims(sub: &str, role: Option<&str>) -> TokenClaims {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        TokenClaims {
            sub: sub.into(),
            exp: now + 600,
            iat: now,
            iss: Some("crash-auth".into()),
            aud: Some(serde_json::json!("crash-players")),
            role: role.map(String::from),
        }
    }

    fn config() -> AuthConfig {
        AuthConfig { secret: Some(SECRET.into()), ..Default::default() }
    }

    #[test]
    fn test_valid_token_maps_to_stable_account() {
        let token = sign(&claims("player-1", None), SECRET);
        let parsed = validate_token(&token, &config()).unwrap();

        assert_eq!(parsed.user_id(), derive_user_id("player-1"));
        assert_ne!(parsed.user_id(), derive_user_id("player-2"));
        assert!(!parsed.is_admin());
    }

    #[test]
    fn test_admin_role() {
        let token = sign(&claims("ops", Some(ADMIN_ROLE)), SECRET);
        assert!(validate_token(&token, &config()).unwrap().is_admin());
    }

    #[test]
    fn test_expired_rejected_unless_skipped() {
        let mut c = claims("player-1", None);
        c.exp = 1;
        let token = sign(&c, SECRET);

        assert!(matches!(validate_token(&token, &config()), Err(AuthError::Expired)));

        let lenient = AuthConfig { skip_expiry: true, ..config() };
        assert!(validate_token(&token, &lenient).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = sign(&claims("player-1", None), "some-other-secret-of-32-bytes!!");
        assert!(matches!(validate_token(&token, &config()), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_issuer_and_subject_checks() {
        let token = sign(&claims("player-1", None), SECRET);
        let strict = AuthConfig { issuer: Some("elsewhere".into()), ..config() };
        assert!(matches!(validate_token(&token, &strict), Err(AuthError::InvalidIssuer)));

        let token = sign(&claims("", None), SECRET);
        assert!(matches!(validate_token(&token, &config()), Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_unconfigured() {
        assert!(matches!(
            validate_token("a.b.c", &AuthConfig::default()),
            Err(AuthError::NotConfigured)
        ));
    }
}
