//! Target parsing and tonic `Endpoint` construction.

use std::fmt;

use http::Uri;
use tonic::transport::{ClientTlsConfig, Endpoint};

use crate::config::ChannelConfig;
use crate::error::ConnectivityError;

const TLS_PORT: u16 = 443;

/// Transport security for the outbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    /// TLS with the platform's native root certificates.
    Tls,
    /// Plaintext HTTP/2.
    Plaintext,
}

impl fmt::Display for TransportSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls => f.write_str("tls"),
            Self::Plaintext => f.write_str("plaintext"),
        }
    }
}

/// Remote endpoint of the outbound channel.
///
/// Accepts `host:port` or a URI with an `http`/`https` scheme. Port 443
/// selects TLS; every other port (or none) is plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    uri: Uri,
    security: TransportSecurity,
}

impl Target {
    /// Parse an endpoint string.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::InvalidEndpoint`] for an empty string, a
    /// missing host, or anything other than a bare authority.
    pub fn parse(raw: &str) -> Result<Self, ConnectivityError> {
        let invalid = |reason: &str| ConnectivityError::InvalidEndpoint {
            endpoint: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("endpoint is empty"));
        }
        let authority = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed)
            .trim_end_matches('/');

        let probe: Uri = format!("http://{authority}")
            .parse()
            .map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        if probe.host().is_none_or(str::is_empty) {
            return Err(invalid("missing host"));
        }
        if probe.path() != "/" || probe.query().is_some() {
            return Err(invalid("endpoint must be host:port without a path"));
        }
        if probe.port().is_some() && probe.port_u16().is_none() {
            return Err(invalid("port must be a number between 0 and 65535"));
        }

        let security = if probe.port_u16() == Some(TLS_PORT) {
            TransportSecurity::Tls
        } else {
            TransportSecurity::Plaintext
        };
        let scheme = match security {
            TransportSecurity::Tls => "https",
            TransportSecurity::Plaintext => "http",
        };
        let uri = format!("{scheme}://{authority}")
            .parse()
            .map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;

        Ok(Self { uri, security })
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    #[must_use]
    pub fn security(&self) -> TransportSecurity {
        self.security
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uri.authority() {
            Some(authority) => write!(f, "{authority}"),
            None => write!(f, "{}", self.uri),
        }
    }
}

/// Build a tonic `Endpoint` with timeouts, keepalive and transport security.
///
/// # Errors
///
/// Returns [`ConnectivityError::InvalidEndpoint`] if TLS cannot be configured
/// for the target.
pub fn build_endpoint(target: &Target, cfg: &ChannelConfig) -> Result<Endpoint, ConnectivityError> {
    let endpoint = Endpoint::from(target.uri.clone())
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.call_timeout)
        .tcp_keepalive(cfg.tcp_keepalive)
        .http2_keep_alive_interval(cfg.http2_keep_alive_interval)
        .keep_alive_timeout(cfg.keep_alive_timeout)
        .keep_alive_while_idle(cfg.keep_alive_while_idle);

    match target.security {
        TransportSecurity::Plaintext => Ok(endpoint),
        TransportSecurity::Tls => endpoint
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|e| ConnectivityError::InvalidEndpoint {
                endpoint: target.to_string(),
                reason: format!("TLS configuration: {e}"),
            }),
    }
}
