//! Relay configuration: built-in defaults, an optional YAML file, then the
//! process environment.
//!
//! Keys are the lower-cased environment variable names, so
//! `observer_endpoint: "localhost:50052"` in YAML and
//! `OBSERVER_ENDPOINT=localhost:50052` in the environment set the same value.
//! [`RawConfig`] holds what was loaded; [`RawConfig::validate`] turns it into
//! the immutable [`RelayConfig`] handed to every component.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Format, Serialized, Yaml};
use relay_credentials::{
    CredentialConfig, CredentialError, DEFAULT_LOGIN_ENDPOINT, DEFAULT_REFRESH_ENDPOINT,
};
use relay_transport_grpc::{ChannelConfig, Target};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::logging::LogFormat;

pub const DEFAULT_OBSERVER_ENDPOINT: &str = "observer.systemiq.ai:443";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:50051";
pub const DEFAULT_MAX_MSG_SIZE_MB: u16 = 4;

const REDACTED: &str = "***REDACTED***";
const MIB: usize = 1 << 20;

/// Environment variables read as the top configuration layer.
const ENV_KEYS: &[&str] = &[
    "AUTH_LOGIN_ENDPOINT",
    "AUTH_REFRESH_ENDPOINT",
    "AUTH_EMAIL",
    "AUTH_PASSWORD",
    "AUTH_CLIENT_ID",
    "OBSERVER_ENDPOINT",
    "OBSERVER_MAX_MSG_SIZE_MB",
    "LISTEN_ADDR",
    "TEST_MODE",
    "LOG_FORMAT",
];

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("config file does not exist: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("failed to render configuration: {0}")]
    Render(String),
}

/// A scalar that may arrive typed (YAML) or as text (environment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl Scalar {
    fn positive_integer(&self) -> Option<u64> {
        match self {
            Self::Int(n) => u64::try_from(*n).ok(),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bool(_) | Self::Float(_) => None,
        }
        .filter(|n| *n > 0)
    }

    /// `true`, `TRUE` and `1` enable; anything else disables.
    fn flag(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(n) => *n == 1,
            Self::Text(s) => s.trim().eq_ignore_ascii_case("true") || s.trim() == "1",
            Self::Float(_) => false,
        }
    }
}

/// Configuration as loaded, before validation.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub auth_login_endpoint: String,
    pub auth_refresh_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_client_id: Option<Scalar>,
    pub observer_endpoint: String,
    pub observer_max_msg_size_mb: Scalar,
    pub listen_addr: String,
    pub test_mode: Scalar,
    pub log_format: String,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            auth_login_endpoint: DEFAULT_LOGIN_ENDPOINT.to_owned(),
            auth_refresh_endpoint: DEFAULT_REFRESH_ENDPOINT.to_owned(),
            auth_email: None,
            auth_password: None,
            auth_client_id: None,
            observer_endpoint: DEFAULT_OBSERVER_ENDPOINT.to_owned(),
            observer_max_msg_size_mb: Scalar::Int(i64::from(DEFAULT_MAX_MSG_SIZE_MB)),
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
            test_mode: Scalar::Bool(false),
            log_format: LogFormat::Text.to_string(),
        }
    }
}

impl fmt::Debug for RawConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConfig")
            .field("auth_login_endpoint", &self.auth_login_endpoint)
            .field("auth_refresh_endpoint", &self.auth_refresh_endpoint)
            .field("auth_email", &self.auth_email)
            .field("auth_password", &self.auth_password.as_ref().map(|_| REDACTED))
            .field("auth_client_id", &self.auth_client_id)
            .field("observer_endpoint", &self.observer_endpoint)
            .field("observer_max_msg_size_mb", &self.observer_max_msg_size_mb)
            .field("listen_addr", &self.listen_addr)
            .field("test_mode", &self.test_mode)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl RawConfig {
    /// Load defaults, then `path` (if given), then the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileNotFound`] for a missing file and
    /// [`ConfigError::Load`] if a layer cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Serialized::globals(env_overrides()))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Check every setting and build the runtime configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for absent credentials and
    /// [`ConfigError::Invalid`] for an invalid client id, URL or address.
    /// An unusable message size or log format falls back to its default.
    pub fn validate(&self) -> Result<RelayConfig, ConfigError> {
        let email = required(self.auth_email.as_deref(), "AUTH_EMAIL")?;
        let password = required(self.auth_password.as_deref(), "AUTH_PASSWORD")?;
        let client_id = self
            .auth_client_id
            .as_ref()
            .ok_or(ConfigError::Missing("AUTH_CLIENT_ID"))?
            .positive_integer()
            .ok_or_else(|| invalid("AUTH_CLIENT_ID", "must be a positive integer"))?;

        let credentials = CredentialConfig::new(email, password, client_id)?.with_endpoints(
            parse_url("AUTH_LOGIN_ENDPOINT", &self.auth_login_endpoint)?,
            parse_url("AUTH_REFRESH_ENDPOINT", &self.auth_refresh_endpoint)?,
        );
        credentials.validate()?;

        let observer_endpoint = self.observer_endpoint.trim().to_owned();
        Target::parse(&observer_endpoint)
            .map_err(|e| invalid("OBSERVER_ENDPOINT", &e.to_string()))?;

        let max_message_size = self.max_message_size_or_default();

        let listen_addr = self
            .listen_addr
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| invalid("LISTEN_ADDR", &e.to_string()))?;

        let log_format = self.log_format.parse::<LogFormat>().unwrap_or_else(|e| {
            tracing::warn!(value = %self.log_format, error = %e, "invalid LOG_FORMAT, using text");
            LogFormat::Text
        });

        Ok(RelayConfig {
            credentials,
            observer_endpoint,
            channel: ChannelConfig::new("observer"),
            listen_addr,
            max_message_size,
            test_mode: self.test_mode.flag(),
            log_format,
        })
    }

    /// Log format to install before [`validate`](Self::validate) runs.
    #[must_use]
    pub fn log_format_or_default(&self) -> LogFormat {
        self.log_format.parse().unwrap_or_default()
    }

    fn max_message_size_or_default(&self) -> usize {
        let default_mb = usize::from(DEFAULT_MAX_MSG_SIZE_MB);
        self.observer_max_msg_size_mb
            .positive_integer()
            .and_then(|mb| usize::try_from(mb).ok())
            .and_then(|mb| mb.checked_mul(MIB))
            .unwrap_or_else(|| {
                tracing::warn!(
                    value = %self.observer_max_msg_size_mb,
                    default_mb,
                    "invalid OBSERVER_MAX_MSG_SIZE_MB, using default"
                );
                default_mb * MIB
            })
    }

    /// Render as YAML with the password masked.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Render`] if serialization fails.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.auth_password.is_some() {
            shown.auth_password = Some(REDACTED.to_owned());
        }
        serde_saphyr::to_string(&shown).map_err(|e| ConfigError::Render(e.to_string()))
    }
}

/// Validated, immutable relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub credentials: CredentialConfig,
    pub observer_endpoint: String,
    pub channel: ChannelConfig,
    pub listen_addr: SocketAddr,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    pub test_mode: bool,
    pub log_format: LogFormat,
}

// Read verbatim: a password such as `0123` must not be coerced into a number.
fn env_overrides() -> BTreeMap<String, String> {
    ENV_KEYS
        .iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.is_empty())
                .map(|value| (key.to_ascii_lowercase(), value))
        })
        .collect()
}

fn required<'a>(value: Option<&'a str>, key: &'static str) -> Result<&'a str, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|e| invalid(key, &e.to_string()))
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use figment::Jail;
    use secrecy::ExposeSecret;
    use tracing_test::traced_test;

    fn set_credentials(jail: &mut Jail) {
        jail.set_env("AUTH_EMAIL", "ops@example.com");
        jail.set_env("AUTH_PASSWORD", "pw");
        jail.set_env("AUTH_CLIENT_ID", "2");
    }

    #[test]
    fn defaults_apply_when_only_credentials_are_set() {
        Jail::expect_with(|jail| {
            set_credentials(jail);

            let cfg = RawConfig::load(None).unwrap().validate().unwrap();

            assert_eq!(cfg.credentials.client_id, 2);
            assert_eq!(cfg.credentials.login_endpoint.as_str(), DEFAULT_LOGIN_ENDPOINT);
            assert_eq!(cfg.credentials.refresh_endpoint.as_str(), DEFAULT_REFRESH_ENDPOINT);
            assert_eq!(cfg.observer_endpoint, DEFAULT_OBSERVER_ENDPOINT);
            assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR.parse().unwrap());
            assert_eq!(cfg.max_message_size, 4 * MIB);
            assert!(!cfg.test_mode);
            assert_eq!(cfg.log_format, LogFormat::Text);
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_yaml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "relay.yaml",
                r#"
auth_email: "file@example.com"
auth_password: "from-file"
auth_client_id: 7
observer_endpoint: "localhost:50052"
observer_max_msg_size_mb: 16
test_mode: true
log_format: json
"#,
            )?;
            jail.set_env("AUTH_CLIENT_ID", "9");

            let cfg = RawConfig::load(Some(Path::new("relay.yaml")))
                .unwrap()
                .validate()
                .unwrap();

            assert_eq!(cfg.credentials.email, "file@example.com");
            assert_eq!(cfg.credentials.client_id, 9);
            assert_eq!(cfg.observer_endpoint, "localhost:50052");
            assert_eq!(cfg.max_message_size, 16 * MIB);
            assert!(cfg.test_mode);
            assert_eq!(cfg.log_format, LogFormat::Json);
            Ok(())
        });
    }

    #[test]
    fn missing_credentials_are_reported_by_name() {
        Jail::expect_with(|jail| {
            jail.set_env("AUTH_PASSWORD", "pw");
            jail.set_env("AUTH_CLIENT_ID", "2");

            let err = RawConfig::load(None).unwrap().validate().unwrap_err();
            assert!(matches!(err, ConfigError::Missing("AUTH_EMAIL")), "{err}");
            Ok(())
        });
    }

    #[test]
    fn client_id_must_be_a_positive_integer() {
        for bad in ["abc", "0", "-3", "2.5"] {
            Jail::expect_with(|jail| {
                set_credentials(jail);
                jail.set_env("AUTH_CLIENT_ID", bad);

                let err = RawConfig::load(None).unwrap().validate().unwrap_err();
                assert!(
                    matches!(err, ConfigError::Invalid { key: "AUTH_CLIENT_ID", .. }),
                    "{bad}: {err}"
                );
                Ok(())
            });
        }
    }

    #[test]
    fn test_mode_accepts_true_and_one_only() {
        for (value, expected) in [("true", true), ("TRUE", true), ("1", true), ("yes", false), ("0", false)] {
            Jail::expect_with(|jail| {
                set_credentials(jail);
                jail.set_env("TEST_MODE", value);

                let cfg = RawConfig::load(None).unwrap().validate().unwrap();
                assert_eq!(cfg.test_mode, expected, "TEST_MODE={value}");
                Ok(())
            });
        }
    }

    #[test]
    fn secrets_are_taken_verbatim() {
        Jail::expect_with(|jail| {
            set_credentials(jail);
            jail.set_env("AUTH_PASSWORD", "0123");

            let cfg = RawConfig::load(None).unwrap().validate().unwrap();
            assert_eq!(cfg.credentials.password.expose_secret(), "0123");
            Ok(())
        });
    }

    #[test]
    fn empty_env_values_fall_back_to_defaults() {
        Jail::expect_with(|jail| {
            set_credentials(jail);
            jail.set_env("AUTH_LOGIN_ENDPOINT", "");

            let cfg = RawConfig::load(None).unwrap().validate().unwrap();
            assert_eq!(cfg.credentials.login_endpoint.as_str(), DEFAULT_LOGIN_ENDPOINT);
            Ok(())
        });
    }

    #[test]
    #[traced_test]
    fn unusable_message_size_falls_back_to_default() {
        for bad in ["abc", "0", "-2", "1.5"] {
            Jail::expect_with(|jail| {
                set_credentials(jail);
                jail.set_env("OBSERVER_MAX_MSG_SIZE_MB", bad);

                let cfg = RawConfig::load(None).unwrap().validate().unwrap();
                assert_eq!(cfg.max_message_size, 4 * MIB, "OBSERVER_MAX_MSG_SIZE_MB={bad}");
                Ok(())
            });
        }
        assert!(logs_contain("invalid OBSERVER_MAX_MSG_SIZE_MB"));
    }

    #[test]
    #[traced_test]
    fn unknown_log_format_falls_back_to_text() {
        Jail::expect_with(|jail| {
            set_credentials(jail);
            jail.set_env("LOG_FORMAT", "xml");

            let raw = RawConfig::load(None).unwrap();
            assert_eq!(raw.log_format_or_default(), LogFormat::Text);
            assert_eq!(raw.validate().unwrap().log_format, LogFormat::Text);
            Ok(())
        });
        assert!(logs_contain("invalid LOG_FORMAT"));
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        Jail::expect_with(|jail| {
            set_credentials(jail);
            jail.set_env("LISTEN_ADDR", "not-an-address");
            let err = RawConfig::load(None).unwrap().validate().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { key: "LISTEN_ADDR", .. }));

            jail.set_env("LISTEN_ADDR", "127.0.0.1:6000");
            jail.set_env("OBSERVER_ENDPOINT", "observer.systemiq.ai:notaport");
            let err = RawConfig::load(None).unwrap().validate().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { key: "OBSERVER_ENDPOINT", .. }), "{err}");
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_reported() {
        let err = RawConfig::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn yaml_rendering_masks_password() {
        let raw = RawConfig {
            auth_email: Some("ops@example.com".into()),
            auth_password: Some("hunter2".into()),
            auth_client_id: Some(Scalar::Int(2)),
            ..RawConfig::default()
        };

        let yaml = raw.to_yaml().unwrap();
        assert!(yaml.contains(REDACTED), "{yaml}");
        assert!(!yaml.contains("hunter2"), "{yaml}");
        assert!(!format!("{raw:?}").contains("hunter2"));
    }
}
