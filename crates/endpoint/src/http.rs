//! JSON-over-HTTP endpoint for a remote credential service
//!
//! Wire contract (all bodies JSON):
//! - `POST   {base}/v1/sessions`              authenticate, returns `{"token": ...}`
//! - `POST   {base}/v1/credentials`           change a password, returns 2xx
//! - `POST   {base}/v1/sessions/{token}/ping` liveness
//! - `DELETE {base}/v1/sessions/{token}`      logoff
//!
//! Failures come back as `{"error": {"code": "...", "message": "..."}}` where
//! `code` is one of the `ErrorKind` codes. Responses without a recognizable
//! code are classified from the status alone.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    AuthRequest, BoxFuture, CredentialChange, Error, ErrorKind, PrivilegeLevel, Result,
    ServerEndpoint, SessionToken,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthBody<'a> {
    user: &'a str,
    password: &'a str,
    connect_string: &'a str,
    privilege: PrivilegeLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_password: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangeBody<'a> {
    token: &'a str,
    user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_password: Option<&'a str>,
    new_password: &'a str,
    as_privileged: bool,
}

#[derive(Deserialize)]
struct TokenBody {
    token: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

/// Endpoint that forwards every call to a remote credential service.
pub struct HttpEndpoint {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpEndpoint {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            client,
            base_url,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/v1/sessions/{token}[/{action}]` with the token percent-encoded
    /// as a single path segment.
    fn session_url(&self, token: &SessionToken, action: Option<&str>) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| Error::unavailable(format!("invalid credential service url: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| Error::unavailable("credential service url cannot take a path"))?;
            segments
                .pop_if_empty()
                .extend(["v1", "sessions", token.as_str()]);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::unavailable(format!("request to credential service failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        Err(decode_error(status.as_u16(), &body))
    }

    async fn do_authenticate(&self, request: &AuthRequest) -> Result<SessionToken> {
        let body = AuthBody {
            user: &request.user,
            password: request.password.expose(),
            connect_string: &request.connect_string,
            privilege: request.privilege,
            new_password: request.new_password.as_ref().map(|p| p.expose().as_str()),
        };
        let response = self
            .send(
                self.client
                    .post(format!("{}/v1/sessions", self.base_url))
                    .json(&body),
            )
            .await?;
        let token: TokenBody = response
            .json()
            .await
            .map_err(|e| Error::unavailable(format!("invalid session response: {e}")))?;
        debug!(user = %request.user, "remote session authenticated");
        Ok(SessionToken::new(token.token))
    }

    async fn do_change_credential(&self, change: &CredentialChange) -> Result<()> {
        let body = ChangeBody {
            token: change.caller.as_str(),
            user: &change.user,
            old_password: change.old_password.as_ref().map(|p| p.expose().as_str()),
            new_password: change.new_password.expose(),
            as_privileged: change.as_privileged,
        };
        self.send(
            self.client
                .post(format!("{}/v1/credentials", self.base_url))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn do_ping(&self, token: &SessionToken) -> Result<()> {
        let url = self.session_url(token, Some("ping"))?;
        self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn do_logoff(&self, token: &SessionToken) -> Result<()> {
        let url = self.session_url(token, None)?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }
}

impl ServerEndpoint for HttpEndpoint {
    fn id(&self) -> &str {
        "http"
    }

    fn authenticate<'a>(&'a self, request: &'a AuthRequest) -> BoxFuture<'a, Result<SessionToken>> {
        Box::pin(self.do_authenticate(request))
    }

    fn change_credential<'a>(&'a self, change: &'a CredentialChange) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.do_change_credential(change))
    }

    fn ping<'a>(&'a self, token: &'a SessionToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.do_ping(token))
    }

    fn logoff<'a>(&'a self, token: &'a SessionToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.do_logoff(token))
    }
}

/// Classify a non-success response.
///
/// A recognized `error.code` in the body wins; otherwise 401 maps to
/// `InvalidCredentials`, 403 to `InsufficientPrivilege`, 404/410 to
/// `SessionClosed` and everything else to `EndpointUnavailable`.
pub fn decode_error(status: u16, body: &str) -> Error {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        match ErrorKind::from_code(&envelope.error.code) {
            Some(kind) => return Error::new(kind, envelope.error.message),
            None => warn!(
                status,
                code = %envelope.error.code,
                "unknown error code from credential service"
            ),
        }
    }
    match status {
        401 => Error::invalid_credentials(),
        403 => Error::insufficient_privilege(),
        404 | 410 => Error::session_closed(),
        _ => Error::unavailable(format!("credential service returned {status}: {body}")),
    }
}
