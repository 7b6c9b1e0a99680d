//! Authorization hooks for entering containers.
//!
//! `authorize` and `resolve_container_id` are extension points and currently
//! let everything through. `validate_console_role` is the role check against
//! the console's SSO endpoint that a real policy would build on.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Header carrying the caller's access token.
pub const ACCESS_TOKEN_HEADER: &str = "access-token";

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorize failed")]
    Denied,
    #[error("console returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("console request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("console response is not valid json: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleAuthConf {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ConsoleRole {
    #[serde(default)]
    role: String,
}

#[derive(Debug, Deserialize)]
struct ConsoleAuthResponse {
    #[serde(default, rename = "msg")]
    #[allow(dead_code)]
    message: String,
    #[serde(default)]
    role: ConsoleRole,
}

#[derive(Debug, Clone)]
pub struct Authorizer {
    http: Client,
    console_url: Option<String>,
}

impl Authorizer {
    pub fn new(console_url: Option<String>) -> Result<Self, AuthError> {
        let http = Client::builder().timeout(DEFAULT_HTTP_TIMEOUT).build()?;
        Ok(Self { http, console_url })
    }

    /// Decides whether the holder of `token` may open a terminal in
    /// `container_id`. No policy is enforced yet; an enforcing hook would
    /// pass the configured console url to [`Authorizer::validate_console_role`].
    pub async fn authorize(&self, token: Option<&str>, container_id: &str) -> Result<(), AuthError> {
        debug!(
            container_id,
            has_token = token.is_some(),
            console = self.console_url.as_deref().unwrap_or("-"),
            "authorization hook passed"
        );
        Ok(())
    }

    /// Maps an application/proc/instance triple onto a container id. The
    /// instance value is used as-is.
    pub async fn resolve_container_id(
        &self,
        _app_name: &str,
        _proc_name: &str,
        instance: &str,
    ) -> Result<String, AuthError> {
        Ok(instance.to_string())
    }

    /// Asks the console whether `token` carries a role. Fails on a non-2xx
    /// status, an unreadable or non-JSON body, or an empty role.
    pub async fn validate_console_role(&self, auth_url: &str, token: &str) -> Result<(), AuthError> {
        let response = self
            .http
            .get(auth_url)
            .header(ACCESS_TOKEN_HEADER, token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Status(status));
        }
        let body = response.bytes().await?;
        let parsed: ConsoleAuthResponse = serde_json::from_slice(&body)?;
        if parsed.role.role.is_empty() {
            return Err(AuthError::Denied);
        }
        Ok(())
    }
}
