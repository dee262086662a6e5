//! Wire access for the client side.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, header::RETRY_AFTER};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use super::errors::SessionError;
use crate::{APP_USER_AGENT, session::IssuedTokens};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A successful call here revokes every token of the account.
pub const PASSWORD_PATH: &str = "/v1/auth/password";

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }

    /// Whether a successful response means the local session is dead.
    #[must_use]
    pub fn ends_session(&self) -> bool {
        self.method == Method::POST && self.path == PASSWORD_PATH
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, if any.
    pub retry_after: Option<u64>,
    pub body: Value,
}

impl ApiResponse {
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("error").and_then(Value::as_str)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// What a response means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ok,
    /// Retryable: refresh and replay.
    Expired,
    /// The session is gone: purge and go to login.
    Fatal,
    PasswordChangeRequired,
    Throttled { retry_after_seconds: u64 },
}

#[must_use]
pub fn classify(response: &ApiResponse) -> Signal {
    match response.status {
        401 if response.error_code() == Some("token_expired") => Signal::Expired,
        401 => Signal::Fatal,
        403 if response.error_code() == Some("password_change_required") => {
            Signal::PasswordChangeRequired
        }
        429 => Signal::Throttled {
            retry_after_seconds: response
                .retry_after
                .or_else(|| response.body.get("retry_after").and_then(Value::as_u64))
                .unwrap_or(1),
        },
        _ => Signal::Ok,
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request`, stamping `access_token` as the bearer credential.
    async fn send(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, SessionError>;

    async fn refresh(&self, refresh_token: &str) -> Result<IssuedTokens, SessionError>;

    async fn login(&self, identifier: &str, password: &str) -> Result<IssuedTokens, SessionError>;

    async fn logout(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), SessionError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    /// # Errors
    /// Returns an error if `base_url` is not a valid URL or the client cannot be built.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
        })
    }

    fn url(&self, path: &str) -> Result<Url, SessionError> {
        self.base_url
            .join(path)
            .map_err(|err| SessionError::Transport(format!("invalid path {path}: {err}")))
    }

    async fn exchange(&self, request: RequestBuilder) -> Result<ApiResponse, SessionError> {
        let response = request
            .send()
            .await
            .map_err(|err| SessionError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok());
        let bytes = response
            .bytes()
            .await
            .map_err(|err| SessionError::Transport(err.to_string()))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        debug!(status, "response received");
        Ok(ApiResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn issued_tokens(response: ApiResponse) -> Result<IssuedTokens, SessionError> {
    match classify(&response) {
        Signal::Ok if response.is_success() => {
            serde_json::from_value(response.body)
                .map_err(|err| SessionError::Transport(format!("unexpected token response: {err}")))
        }
        Signal::Throttled {
            retry_after_seconds,
        } => Err(SessionError::Throttled {
            retry_after_seconds,
        }),
        Signal::Ok => Err(SessionError::Transport(format!(
            "unexpected status {}",
            response.status
        ))),
        _ => Err(SessionError::Unauthenticated),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    async fn send(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, SessionError> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path)?);
        if let Some(token) = access_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        self.exchange(builder).await
    }

    #[instrument(skip_all)]
    async fn refresh(&self, refresh_token: &str) -> Result<IssuedTokens, SessionError> {
        let builder = self
            .client
            .post(self.url("/v1/auth/refresh")?)
            .json(&json!({ "refresh_token": refresh_token }));
        issued_tokens(self.exchange(builder).await?)
    }

    #[instrument(skip_all)]
    async fn login(&self, identifier: &str, password: &str) -> Result<IssuedTokens, SessionError> {
        let builder = self
            .client
            .post(self.url("/v1/auth/login")?)
            .json(&json!({ "identifier": identifier, "password": password }));
        issued_tokens(self.exchange(builder).await?)
    }

    #[instrument(skip_all)]
    async fn logout(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), SessionError> {
        let builder = self
            .client
            .post(self.url("/v1/auth/logout")?)
            .bearer_auth(access_token)
            .json(&json!({ "refresh_token": refresh_token }));
        let response = self.exchange(builder).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(SessionError::Transport(format!(
                "logout failed with status {}",
                response.status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: Value) -> ApiResponse {
        ApiResponse {
            status,
            retry_after: None,
            body,
        }
    }

    #[test]
    fn expired_is_the_only_retryable_401() {
        assert_eq!(
            classify(&response(401, json!({"error": "token_expired"}))),
            Signal::Expired
        );
        assert_eq!(
            classify(&response(401, json!({"error": "invalid_token"}))),
            Signal::Fatal
        );
        assert_eq!(classify(&response(401, Value::Null)), Signal::Fatal);
    }

    #[test]
    fn forced_change_and_throttle_are_recognized() {
        assert_eq!(
            classify(&response(403, json!({"error": "password_change_required"}))),
            Signal::PasswordChangeRequired
        );
        assert_eq!(
            classify(&response(403, json!({"error": "forbidden"}))),
            Signal::Ok
        );

        let mut throttled = response(429, json!({"error": "rate_limited", "retry_after": 42}));
        assert_eq!(
            classify(&throttled),
            Signal::Throttled {
                retry_after_seconds: 42
            }
        );
        throttled.retry_after = Some(7);
        assert_eq!(
            classify(&throttled),
            Signal::Throttled {
                retry_after_seconds: 7
            }
        );
    }

    #[test]
    fn token_response_errors_map_to_session_errors() {
        assert_eq!(
            issued_tokens(response(401, json!({"error": "invalid_token"}))).err(),
            Some(SessionError::Unauthenticated)
        );
        assert!(matches!(
            issued_tokens(response(500, Value::Null)),
            Err(SessionError::Transport(_))
        ));
    }

    #[test]
    fn only_password_change_ends_the_session() {
        assert!(ApiRequest::post(PASSWORD_PATH, Value::Null).ends_session());
        assert!(!ApiRequest::get(PASSWORD_PATH).ends_session());
        assert!(!ApiRequest::post("/v1/proposals", Value::Null).ends_session());
    }

    #[test]
    fn http_transport_joins_paths() -> anyhow::Result<()> {
        let transport = HttpTransport::new("http://127.0.0.1:8080")?;
        assert_eq!(
            transport.url("/v1/auth/login")?.as_str(),
            "http://127.0.0.1:8080/v1/auth/login"
        );
        assert!(HttpTransport::new("not a url").is_err());
        Ok(())
    }
}
