use thiserror::Error;

/// Errors returned by the credential lifecycle.
///
/// Variants never carry token or password material; HTTP failures are
/// rendered from status codes and transport descriptions only.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// Login was rejected, the response was malformed, or it held no entry
    /// for the configured client.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// No refresh token is held, the refresh call failed, or the response
    /// belongs to a different client.
    #[error("token refresh failed: {0}")]
    Refresh(String),

    /// The access token is not a JWT or carries no usable `exp` claim.
    #[error("invalid access token: {0}")]
    Token(String),

    /// Both the refresh and the fallback login failed.
    #[error("token renewal failed (refresh: {refresh}; login: {login})")]
    Renewal {
        refresh: Box<CredentialError>,
        login: Box<CredentialError>,
    },

    /// Configuration is invalid (empty email, zero client id, ...).
    #[error("credential config error: {0}")]
    Config(String),
}

impl CredentialError {
    pub(crate) fn renewal(refresh: Self, login: Self) -> Self {
        Self::Renewal {
            refresh: Box::new(refresh),
            login: Box::new(login),
        }
    }
}
