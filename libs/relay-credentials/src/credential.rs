use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::SecretString;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::CredentialError;

/// A bearer credential issued for one client.
///
/// The access token and its expiry are derived together in [`Credential::issue`]
/// and the struct is only ever replaced whole, so a holder never sees a token
/// paired with another token's expiry.
#[derive(Clone)]
pub struct Credential {
    access_token: SecretString,
    refresh_token: SecretString,
    expires_at: OffsetDateTime,
    client_id: u64,
}

impl Credential {
    /// Build a credential, reading the expiry from the access token's `exp` claim.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Token`] if the access token is not a JWT or
    /// has no numeric `exp` claim.
    pub fn issue(
        access_token: String,
        refresh_token: String,
        client_id: u64,
    ) -> Result<Self, CredentialError> {
        let expires_at = token_expiry(&access_token)?;
        Ok(Self {
            access_token: SecretString::from(access_token),
            refresh_token: SecretString::from(refresh_token),
            expires_at,
            client_id,
        })
    }

    #[must_use]
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &SecretString {
        &self.refresh_token
    }

    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    #[must_use]
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// `true` once `now` has reached the expiry instant.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Lifetime left at `now`; negative once expired.
    #[must_use]
    pub fn remaining_at(&self, now: OffsetDateTime) -> time::Duration {
        self.expires_at - now
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Read the `exp` claim of a JWT without verifying its signature.
///
/// The relay only forwards the token; verification is the remote's job.
/// The header is still parsed so that non-JWT strings are rejected early.
///
/// # Errors
///
/// Returns [`CredentialError::Token`] if the token is malformed or the claim
/// is missing or out of range.
pub fn token_expiry(token: &str) -> Result<OffsetDateTime, CredentialError> {
    jsonwebtoken::decode_header(token)
        .map_err(|e| CredentialError::Token(format!("malformed JWT header: {e}")))?;

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| CredentialError::Token("missing JWT payload segment".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| CredentialError::Token(format!("JWT payload is not base64url: {e}")))?;
    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|e| CredentialError::Token(format!("JWT payload is not JSON: {e}")))?;

    let exp = claims
        .get("exp")
        .and_then(exp_seconds)
        .ok_or_else(|| CredentialError::Token("expiration claim 'exp' not found".into()))?;

    OffsetDateTime::from_unix_timestamp(exp)
        .map_err(|e| CredentialError::Token(format!("expiration claim out of range: {e}")))
}

// Some issuers encode `exp` as a float.
#[allow(clippy::cast_possible_truncation)]
fn exp_seconds(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|secs| secs.trunc() as i64))
}
