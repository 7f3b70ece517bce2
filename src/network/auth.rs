//! Player Authentication
//!
//! Tokens are issued elsewhere; this module only verifies them and maps the
//! subject to a ledger account. With no key configured the server runs in
//! development mode and trusts the account id sent by the client.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::round::state::Account;

/// Longest development-mode account id accepted.
const MAX_ACCOUNT_ID_LEN: usize = 128;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected `iss`. Any issuer when unset.
    pub issuer: Option<String>,
    /// Expected `aud`. Not checked when unset.
    pub audience: Option<String>,
    /// RS256 public key (PEM).
    pub public_key_pem: Option<String>,
    /// HS256 shared secret.
    pub secret: Option<String>,
    /// Accept expired tokens. Tests only.
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Read `CRASH_AUTH_*` environment variables.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(format!("CRASH_AUTH_{}", name)).ok();
        Self {
            issuer: var("ISSUER"),
            audience: var("AUDIENCE"),
            public_key_pem: var("PUBLIC_KEY_PEM"),
            secret: var("SECRET"),
            skip_expiry: matches!(var("SKIP_EXPIRY").as_deref(), Some("1") | Some("true")),
        }
    }

    /// Whether a verification key is present. Without one the server is in
    /// development mode.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }

    /// Decoding key and validation rules. RS256 wins when both keys are set.
    fn verifier(&self) -> Result<(DecodingKey, Validation), AuthError> {
        let (key, mut rules) = match (&self.public_key_pem, &self.secret) {
            (Some(pem), _) => (
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| AuthError::DecodeError(format!("bad RS256 key: {}", e)))?,
                Validation::new(Algorithm::RS256),
            ),
            (None, Some(secret)) => (
                DecodingKey::from_secret(secret.as_bytes()),
                Validation::new(Algorithm::HS256),
            ),
            (None, None) => return Err(AuthError::NotConfigured),
        };

        rules.required_spec_claims.clear();
        rules.validate_exp = !self.skip_expiry;
        if let Some(issuer) = &self.issuer {
            rules.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => rules.set_audience(&[audience]),
            None => rules.validate_aud = false,
        }
        Ok((key, rules))
    }
}

/// Claims read from an incoming token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (provider user id).
    pub sub: String,
    /// Expiry, Unix seconds. Zero means none.
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
}

impl TokenClaims {
    /// Ledger account named by the subject.
    pub fn account(&self) -> Account {
        Account::new(self.sub.clone())
    }
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
    /// Wrong issuer.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Wrong audience.
    #[error("invalid audience")]
    InvalidAudience,
    /// A required claim or field is absent.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Development-mode account id is empty, too long, or has control
    /// characters.
    #[error("invalid player id: {0}")]
    InvalidPlayerId(String),
    /// Other decode failure.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Resolve the account behind an `auth` message.
///
/// With a key configured, `token` must verify and its subject is the
/// account id. In development mode the client-chosen `player_id` is the
/// account id as is.
pub fn authenticate(
    config: &AuthConfig,
    token: Option<&str>,
    player_id: Option<&str>,
) -> Result<Account, AuthError> {
    if config.is_configured() {
        let token = token.ok_or_else(|| AuthError::MissingClaim("token".into()))?;
        return validate_token(token, config).map(|claims| claims.account());
    }

    let raw = player_id.ok_or_else(|| AuthError::MissingClaim("player_id".into()))?;
    let valid = !raw.is_empty()
        && raw.len() <= MAX_ACCOUNT_ID_LEN
        && !raw.chars().any(char::is_control);
    if !valid {
        return Err(AuthError::InvalidPlayerId(raw.escape_debug().to_string()));
    }
    Ok(Account::new(raw))
}

/// Verify a JWT and return its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let (key, rules) = config.verifier()?;
    let TokenData { claims, .. } =
        decode::<TokenClaims>(token, &key, &rules).map_err(map_jwt_error)?;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    // The library skips `exp == 0`; a positive expiry is enforced here too.
    let expired = claims.exp > 0 && (chrono::Utc::now().timestamp().max(0) as u64) > claims.exp;
    if expired && !config.skip_expiry {
        return Err(AuthError::Expired);
    }

    Ok(claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind as Jwt;
    match err.kind() {
        Jwt::ExpiredSignature => AuthError::Expired,
        Jwt::InvalidSignature => AuthError::InvalidSignature,
        Jwt::InvalidIssuer => AuthError::InvalidIssuer,
        Jwt::InvalidAudience => AuthError::InvalidAudience,
        Jwt::InvalidToken | Jwt::Base64(_) | Jwt::Json(_) | Jwt::Utf8(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}
