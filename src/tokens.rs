//! Stateless CLI tokens: short-lived access tokens and long-lived refresh
//! tokens, both HS256-signed JWTs. Nothing is persisted; possession of a
//! token with a valid signature, issuer, audience, expiry, and `type` claim
//! is the whole credential.

use crate::errors::TrellisError;
use crate::settings::Auth;
use josekit::jws::{JwsHeader, HS256};
use josekit::jwt::{self, JwtPayload, JwtPayloadValidator};
use serde_json::Value;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// The `type` claim. A refresh token presented where an access token is
/// expected (or vice versa) must be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// Claims extracted from a verified CLI token.
#[derive(Debug, Clone)]
pub struct CliClaims {
    pub subject: String,
    pub email: Option<String>,
}

#[derive(Debug, Error)]
pub enum TokenVerifyError {
    /// Signature, issuer, audience, expiry, or structural failure. The
    /// detail stays server-side; clients get a generic rejection.
    #[error("invalid token: {0}")]
    Invalid(String),

    /// Valid signature but the `type` claim does not match the expected use.
    #[error("invalid token type")]
    WrongType,
}

impl From<josekit::JoseError> for TokenVerifyError {
    fn from(value: josekit::JoseError) -> Self {
        TokenVerifyError::Invalid(value.to_string())
    }
}

#[derive(Clone)]
pub struct CliTokenSigner {
    secret: Vec<u8>,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl CliTokenSigner {
    /// Returns None when no signing secret is configured. Callers surface
    /// that as a configuration error at request time.
    pub fn from_settings(auth: &Auth) -> Option<Self> {
        let secret = auth.jwt_secret.as_ref()?;
        Some(Self {
            secret: secret.as_bytes().to_vec(),
            issuer: auth.issuer.clone(),
            audience: auth.audience.clone(),
            access_ttl: Duration::from_secs(auth.access_token_ttl_secs.max(0) as u64),
            refresh_ttl: Duration::from_secs(auth.refresh_token_ttl_secs.max(0) as u64),
        })
    }

    pub fn mint_access_token(
        &self,
        subject: &str,
        email: Option<&str>,
    ) -> Result<String, TrellisError> {
        self.mint(subject, email, TokenType::Access, self.access_ttl)
    }

    pub fn mint_refresh_token(
        &self,
        subject: &str,
        email: Option<&str>,
    ) -> Result<String, TrellisError> {
        self.mint(subject, email, TokenType::Refresh, self.refresh_ttl)
    }

    fn mint(
        &self,
        subject: &str,
        email: Option<&str>,
        token_type: TokenType,
        ttl: Duration,
    ) -> Result<String, TrellisError> {
        let signer = HS256.signer_from_bytes(&self.secret)?;
        let mut header = JwsHeader::new();
        header.set_token_type("JWT");

        let now = SystemTime::now();
        let mut payload = JwtPayload::new();
        payload.set_subject(subject);
        if let Some(email) = email {
            payload.set_claim("email", Some(Value::String(email.to_string())))?;
        }
        payload.set_claim("type", Some(Value::String(token_type.as_str().to_string())))?;
        payload.set_issuer(self.issuer.as_str());
        payload.set_audience(vec![self.audience.clone()]);
        payload.set_issued_at(&now);
        payload.set_expires_at(&(now + ttl));

        Ok(jwt::encode_with_signer(&payload, &header, &signer)?)
    }

    /// Full verification: signature, issuer, audience, expiry, `type`, and a
    /// present subject.
    pub fn verify(&self, token: &str, expected: TokenType) -> Result<CliClaims, TokenVerifyError> {
        let verifier = HS256.verifier_from_bytes(&self.secret)?;
        let (payload, _header) = jwt::decode_with_verifier(token, &verifier)?;

        let mut validator = JwtPayloadValidator::new();
        validator.set_base_time(SystemTime::now());
        validator.set_issuer(self.issuer.as_str());
        validator.set_audience(self.audience.as_str());
        validator.validate(&payload)?;

        match payload.claim("type").and_then(Value::as_str) {
            Some(t) if t == expected.as_str() => {}
            _ => return Err(TokenVerifyError::WrongType),
        }

        let subject = payload
            .subject()
            .ok_or_else(|| TokenVerifyError::Invalid("missing subject".to_string()))?
            .to_string();
        let email = payload
            .claim("email")
            .and_then(Value::as_str)
            .map(String::from);

        Ok(CliClaims { subject, email })
    }
}
