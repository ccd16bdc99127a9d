use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::CredentialError;

/// Default login endpoint of the identity service.
pub const DEFAULT_LOGIN_ENDPOINT: &str = "https://api.systemiq.ai/auth/login";

/// Default refresh endpoint of the identity service.
pub const DEFAULT_REFRESH_ENDPOINT: &str = "https://api.systemiq.ai/auth/refresh-token";

/// Configuration for a [`CredentialManager`](crate::CredentialManager).
///
/// `Debug` is manually implemented to redact [`password`](Self::password).
#[derive(Clone)]
pub struct CredentialConfig {
    // ---- identity endpoints -------------------------------------------------
    /// `POST {email, password, client_id}` endpoint.
    pub login_endpoint: Url,

    /// `POST {refresh_token}` endpoint.
    pub refresh_endpoint: Url,

    // ---- credentials --------------------------------------------------------
    /// Account email used for login.
    pub email: String,

    /// Account password (redacted in `Debug` output).
    pub password: SecretString,

    /// Numeric client identifier selecting this deployment's token entry.
    pub client_id: u64,

    // ---- renewal policy -----------------------------------------------------
    /// How often the background loop checks the remaining lifetime (default: 1 min).
    pub renewal_interval: Duration,

    /// Remaining lifetime below which the loop renews (default: 5 min).
    pub renewal_threshold: Duration,

    // ---- HTTP client --------------------------------------------------------
    /// Per-request timeout for identity calls (default: 10 s).
    pub http_timeout: Duration,
}

impl CredentialConfig {
    /// Build a configuration with default endpoints and renewal policy.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Config`] if a default endpoint fails to parse.
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        client_id: u64,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            login_endpoint: parse_endpoint(DEFAULT_LOGIN_ENDPOINT)?,
            refresh_endpoint: parse_endpoint(DEFAULT_REFRESH_ENDPOINT)?,
            email: email.into(),
            password: SecretString::from(password.into()),
            client_id,
            renewal_interval: Duration::from_secs(60),
            renewal_threshold: Duration::from_secs(5 * 60),
            http_timeout: Duration::from_secs(10),
        })
    }

    /// Override both identity endpoints.
    #[must_use]
    pub fn with_endpoints(mut self, login: Url, refresh: Url) -> Self {
        self.login_endpoint = login;
        self.refresh_endpoint = refresh;
        self
    }

    /// Override the renewal tick interval and threshold.
    #[must_use]
    pub fn with_renewal(mut self, interval: Duration, threshold: Duration) -> Self {
        self.renewal_interval = interval;
        self.renewal_threshold = threshold;
        self
    }

    /// Validate that the configuration can drive a login.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Config`] if the email or password is empty,
    /// the client id is zero, or the renewal interval is zero.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.email.trim().is_empty() {
            return Err(CredentialError::Config("email must not be empty".into()));
        }
        if self.password.expose_secret().is_empty() {
            return Err(CredentialError::Config("password must not be empty".into()));
        }
        if self.client_id == 0 {
            return Err(CredentialError::Config(
                "client_id must be a positive integer".into(),
            ));
        }
        if self.renewal_interval.is_zero() {
            return Err(CredentialError::Config(
                "renewal_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, CredentialError> {
    Url::parse(raw).map_err(|e| CredentialError::Config(format!("invalid endpoint {raw}: {e}")))
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("login_endpoint", &self.login_endpoint.as_str())
            .field("refresh_endpoint", &self.refresh_endpoint.as_str())
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("client_id", &self.client_id)
            .field("renewal_interval", &self.renewal_interval)
            .field("renewal_threshold", &self.renewal_threshold)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_identity_service() {
        let cfg = CredentialConfig::new("ops@example.com", "pw", 2).unwrap();
        assert_eq!(cfg.login_endpoint.as_str(), DEFAULT_LOGIN_ENDPOINT);
        assert_eq!(cfg.refresh_endpoint.as_str(), DEFAULT_REFRESH_ENDPOINT);
        assert_eq!(cfg.renewal_interval, Duration::from_secs(60));
        assert_eq!(cfg.renewal_threshold, Duration::from_secs(300));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_client_id_is_rejected() {
        let cfg = CredentialConfig::new("ops@example.com", "pw", 0).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(
            matches!(err, CredentialError::Config(ref msg) if msg.contains("client_id")),
            "expected ConfigError, got: {err}"
        );
    }

    #[test]
    fn empty_credentials_are_rejected() {
        let cfg = CredentialConfig::new(" ", "pw", 2).unwrap();
        assert!(cfg.validate().is_err());

        let cfg = CredentialConfig::new("ops@example.com", "", 2).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let cfg = CredentialConfig::new("ops@example.com", "hunter2-very-secret", 2).unwrap();
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("hunter2-very-secret"), "{dbg}");
        assert!(dbg.contains("[REDACTED]"));
    }
}
