use serde::{Deserialize, Serialize};

/// Body of the login call. The client id travels as a decimal string.
#[derive(Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub client_id: String,
}

/// Login response: one token pair per client the account can act for.
#[derive(Deserialize)]
pub(crate) struct LoginResponse {
    pub clients: Vec<ClientToken>,
}

#[derive(Deserialize)]
pub(crate) struct ClientToken {
    pub client_id: u64,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Deserialize)]
pub(crate) struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: u64,
}
