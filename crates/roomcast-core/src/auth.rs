//! Session Gate and session tokens.
//!
//! Every protected operation starts by exchanging the request's bearer
//! token for an [`Identity`]. The identity is then passed explicitly to the
//! operation and always wins over any sender field a client submits.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::clock::now_millis;

/// Default session lifetime.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("Missing session token")]
    Unauthenticated,

    /// The token is malformed, expired or carries a bad signature.
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    /// A token could not be issued.
    #[error("Failed to issue session: {0}")]
    Issue(String),
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Create an identity for a verified username.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self(username.into())
    }

    /// Get the username.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verifies and issues opaque session tokens.
pub trait SessionVerifier: Send + Sync {
    /// Resolve a token to the identity it was issued for.
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;

    /// Issue a new token for an identity.
    fn issue(&self, identity: &Identity) -> Result<String, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
    exp: u64,
}

/// HS256 JSON Web Token sessions.
pub struct JwtSessions {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl JwtSessions {
    /// Create sessions signed with a shared secret.
    #[must_use]
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::Issue(e.to_string()))
    }
}

impl SessionVerifier for JwtSessions {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::InvalidSession(e.to_string()))?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidSession("empty subject".into()));
        }
        Ok(Identity(data.claims.sub))
    }

    fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        let iat = now_millis() / 1000;
        self.sign(&Claims {
            sub: identity.0.clone(),
            iat,
            exp: iat + self.ttl.as_secs(),
        })
    }
}

/// Authentication check applied to every protected operation.
#[derive(Clone)]
pub struct SessionGate {
    verifier: Arc<dyn SessionVerifier>,
}

impl SessionGate {
    /// Create a gate over a verifier.
    #[must_use]
    pub fn new(verifier: Arc<dyn SessionVerifier>) -> Self {
        Self { verifier }
    }

    /// Authenticate the value of an `Authorization` header.
    ///
    /// Accepts `Bearer <token>` or a bare token.
    ///
    /// # Errors
    ///
    /// `Unauthenticated` when no token is present, `InvalidSession` when the
    /// token does not verify.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<Identity, AuthError> {
        let raw = authorization
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::Unauthenticated)?;

        let token = raw.strip_prefix("Bearer ").map(str::trim).unwrap_or(raw);
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        let identity = self.verifier.verify(token)?;
        debug!(user = %identity, "Session verified");
        Ok(identity)
    }

    /// Issue a session token for an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        self.verifier.issue(identity)
    }
}
