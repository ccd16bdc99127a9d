#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Bearer credential lifecycle for the observer relay.
//!
//! [`CredentialManager`] logs in against the identity service, keeps the
//! resulting [`Credential`] under a single lock, hands out unexpired access
//! tokens, and renews them in the background before they lapse.

pub mod config;
pub mod credential;
pub mod error;
pub mod identity;
pub mod manager;
mod types;

pub use config::{CredentialConfig, DEFAULT_LOGIN_ENDPOINT, DEFAULT_REFRESH_ENDPOINT};
pub use credential::{Credential, token_expiry};
pub use error::CredentialError;
pub use identity::{HttpIdentityClient, IdentityClient};
pub use manager::{CredentialManager, CredentialState, RenewalPolicy};
