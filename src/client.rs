//! Standalone HTTP client for the DKN Cloud NA REST API.
//!
//! - Blocking client using `ureq` (no async).
//! - Covers the two endpoints the bridge needs: login and the installation listing.
//! - The same agent is shared with the realtime channels, so cookies set by the vendor's
//!   load balancer stick to every request of the session.

use http::StatusCode;
use log::debug;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::models::dkn::{Installation, LoginRequest, LoginResponse};

pub const DEFAULT_API_URL: &str = "https://dkncloudna.com/";
pub const DEFAULT_SCOPE: &str = "dknUsa";
const API_VER: &str = "api/v1";
const SOCKET_PATH: &str = "api/v1/devices/socket.io/";
// Long-poll requests are held open by the server for up to its ping interval (25s).
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DknClientError {
    #[error("missing bearer token for authenticated endpoint")]
    MissingAuth,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("json error at '{path}': {message}")]
    Json { path: String, message: String },
    #[error("auth error: {0}")]
    Auth(String),
}

impl From<ureq::Error> for DknClientError {
    fn from(value: ureq::Error) -> Self {
        DknClientError::Transport(value.to_string())
    }
}

pub fn build_agent() -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(HTTP_TIMEOUT))
        .http_status_as_error(false)
        .build()
        .into()
}

/// Decode a JSON body, reporting the path of the first offending field.
pub fn decode_json<T: DeserializeOwned>(body: &str) -> Result<T, DknClientError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|e| DknClientError::Json {
        path: e.path().to_string(),
        message: e.inner().to_string(),
    })
}

pub(crate) fn read_response(
    resp: Result<http::Response<ureq::Body>, ureq::Error>,
) -> Result<(StatusCode, String), ureq::Error> {
    let mut resp = resp?;
    let status = resp.status();
    let body = resp.body_mut().read_to_string()?;
    Ok((status, body))
}

fn parse_login_reply(status: StatusCode, body: &str) -> Result<LoginResponse, DknClientError> {
    if matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
    ) {
        return Err(DknClientError::Auth(format!("http {}: {}", status.as_u16(), body)));
    }
    if !status.is_success() {
        return Err(DknClientError::Http {
            status: status.as_u16(),
            message: body.to_string(),
        });
    }
    let reply: LoginResponse = decode_json(body).map_err(|e| DknClientError::Auth(format!("malformed login reply: {}", e)))?;
    if reply.token.trim().is_empty() {
        return Err(DknClientError::Auth("login reply carries an empty token".to_string()));
    }
    Ok(reply)
}

pub struct DknClient {
    agent: ureq::Agent,
    api_url: String,
    scope: String,
    user_name: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
}

impl DknClient {
    pub fn new(api_url: &str, scope: &str) -> Self {
        let api_url = if api_url.ends_with('/') {
            api_url.to_string()
        } else {
            format!("{}/", api_url)
        };
        DknClient {
            agent: build_agent(),
            api_url,
            scope: scope.to_string(),
            user_name: String::new(),
            access_token: None,
            refresh_token: None,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}/{}", self.api_url, API_VER, path.trim_start_matches('/'))
    }

    pub fn agent(&self) -> &ureq::Agent {
        &self.agent
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Base URL of the Socket.IO endpoint (server root plus the socket path).
    pub fn socket_endpoint(&self) -> String {
        format!("{}{}", self.api_url, SOCKET_PATH)
    }

    pub fn bearer(&self) -> Result<&str, DknClientError> {
        self.access_token.as_deref().ok_or(DknClientError::MissingAuth)
    }

    pub fn authenticate(&mut self, user: &str, password: &str) -> Result<(), DknClientError> {
        let url = self.url(&format!("auth/login/{}", self.scope));
        debug!("Authenticating '{}' against {}", user, url);
        let resp = self
            .agent
            .post(&url)
            .header("Accept", "application/json")
            .send_json(&LoginRequest { email: user, password });
        let (status, body) = read_response(resp)?;
        let reply = parse_login_reply(status, &body)?;

        self.user_name = user.to_string();
        self.access_token = Some(reply.token);
        self.refresh_token = reply.refresh_token;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DknClientError> {
        let url = self.url(path);
        let token = self.bearer()?;
        let resp = self
            .agent
            .get(&url)
            .header("Accept", "application/json")
            .header("Authorization", &format!("Bearer {}", token))
            .call();
        let (status, body) = read_response(resp)?;
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DknClientError::Auth(format!("http {}: {}", status.as_u16(), body)));
        }
        if !status.is_success() {
            return Err(DknClientError::Http {
                status: status.as_u16(),
                message: body,
            });
        }
        decode_json(&body)
    }

    pub fn get_installations(&self) -> Result<Vec<Installation>, DknClientError> {
        self.get_json(&format!("installations/{}", self.scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_urls_with_and_without_trailing_slash() {
        let a = DknClient::new("https://dkncloudna.com", DEFAULT_SCOPE);
        let b = DknClient::new("https://dkncloudna.com/", DEFAULT_SCOPE);
        assert_eq!(a.url("/installations/dknUsa"), "https://dkncloudna.com/api/v1/installations/dknUsa");
        assert_eq!(a.url("installations/dknUsa"), b.url("installations/dknUsa"));
        assert_eq!(a.socket_endpoint(), "https://dkncloudna.com/api/v1/devices/socket.io/");
    }

    #[test]
    fn bearer_requires_login() {
        let client = DknClient::new(DEFAULT_API_URL, DEFAULT_SCOPE);
        assert!(matches!(client.bearer(), Err(DknClientError::MissingAuth)));
    }

    #[test]
    fn accepts_login_fixture() {
        let body = std::fs::read_to_string("tests/data/login.json").expect("fixture present");
        let reply = parse_login_reply(StatusCode::OK, &body).expect("valid login");
        assert!(reply.token.starts_with("eyJ"));
        assert_eq!(reply.refresh_token.as_deref(), Some("3b1f6a0c-refresh"));
    }

    #[test]
    fn rejected_credentials_are_auth_errors() {
        let err = parse_login_reply(StatusCode::UNAUTHORIZED, r#"{"message":"bad credentials"}"#).unwrap_err();
        assert!(matches!(err, DknClientError::Auth(_)));
    }

    #[test]
    fn malformed_login_reply_is_an_auth_error() {
        let err = parse_login_reply(StatusCode::OK, r#"{"refreshToken":"x"}"#).unwrap_err();
        match err {
            DknClientError::Auth(msg) => assert!(msg.contains("token"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
        let err = parse_login_reply(StatusCode::OK, r#"{"token":"  "}"#).unwrap_err();
        assert!(matches!(err, DknClientError::Auth(_)));
    }

    #[test]
    fn server_errors_keep_status() {
        let err = parse_login_reply(StatusCode::BAD_GATEWAY, "upstream down").unwrap_err();
        assert!(matches!(err, DknClientError::Http { status: 502, .. }));
    }

    #[test]
    fn decode_reports_json_path() {
        let err = decode_json::<Vec<Installation>>(r#"[{"_id":"a","devices":[{"mac":7}]}]"#).unwrap_err();
        match err {
            DknClientError::Json { path, .. } => assert_eq!(path, "[0].devices[0].mac"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
