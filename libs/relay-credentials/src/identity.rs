use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::config::CredentialConfig;
use crate::credential::Credential;
use crate::error::CredentialError;
use crate::types::{LoginRequest, LoginResponse, RefreshRequest, RefreshResponse};

/// Network side of the credential lifecycle.
///
/// [`CredentialManager`](crate::CredentialManager) owns the state machine and
/// locking; implementations only perform one exchange per call and never
/// retry.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Authenticate with the configured account and return this client's credential.
    async fn login(&self) -> Result<Credential, CredentialError>;

    /// Exchange a refresh token for a new credential.
    async fn refresh(&self, refresh_token: &SecretString) -> Result<Credential, CredentialError>;
}

/// [`IdentityClient`] speaking JSON over HTTP to the identity service.
pub struct HttpIdentityClient {
    http: reqwest::Client,
    login_endpoint: Url,
    refresh_endpoint: Url,
    email: String,
    password: SecretString,
    client_id: u64,
}

impl HttpIdentityClient {
    /// Build a client from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Config`] if the underlying HTTP client fails
    /// to build (e.g. TLS backend initialisation).
    pub fn new(config: &CredentialConfig) -> Result<Self, CredentialError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| CredentialError::Config(format!("identity HTTP client: {e}")))?;

        Ok(Self {
            http,
            login_endpoint: config.login_endpoint.clone(),
            refresh_endpoint: config.refresh_endpoint.clone(),
            email: config.email.clone(),
            password: config.password.clone(),
            client_id: config.client_id,
        })
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn login(&self) -> Result<Credential, CredentialError> {
        let body = LoginRequest {
            email: &self.email,
            password: self.password.expose_secret(),
            client_id: self.client_id.to_string(),
        };

        let response = self
            .http
            .post(self.login_endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| CredentialError::Authentication(format_http_error(&e, "login")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::Authentication(format!(
                "identity endpoint returned {status}"
            )));
        }

        let login: LoginResponse = response.json().await.map_err(|e| {
            CredentialError::Authentication(format!("malformed login response: {e}"))
        })?;

        let entry = login
            .clients
            .into_iter()
            .find(|c| c.client_id == self.client_id)
            .ok_or_else(|| {
                CredentialError::Authentication(format!(
                    "client_id {} not found in login response",
                    self.client_id
                ))
            })?;

        Credential::issue(entry.access_token, entry.refresh_token, self.client_id)
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<Credential, CredentialError> {
        let body = RefreshRequest {
            refresh_token: refresh_token.expose_secret(),
        };

        let response = self
            .http
            .post(self.refresh_endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| CredentialError::Refresh(format_http_error(&e, "refresh")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::Refresh(format!(
                "identity endpoint returned {status}"
            )));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Refresh(format!("malformed refresh response: {e}")))?;

        if refreshed.client_id != self.client_id {
            return Err(CredentialError::Refresh(format!(
                "client_id mismatch in refresh response (expected {}, got {})",
                self.client_id, refreshed.client_id
            )));
        }

        Credential::issue(
            refreshed.access_token,
            refreshed.refresh_token,
            self.client_id,
        )
    }
}

/// Describe a transport failure without echoing request bodies.
fn format_http_error(e: &reqwest::Error, op: &str) -> String {
    if e.is_timeout() {
        format!("{op} request timed out")
    } else if e.is_connect() {
        format!("{op} request could not connect: {e}")
    } else {
        format!("{op} request failed: {e}")
    }
}
