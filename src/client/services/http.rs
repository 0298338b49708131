use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::client::utils::session_store::SessionError;
use crate::common::models::Envelope;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Session storage failed: {0}")]
    Session(#[from] SessionError),
    #[error("Not logged in")]
    NotAuthenticated,
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Api { status, .. } => Some(*status),
            ApiError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Message carried by the server envelope, if that is what failed.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ApiError::Api { message, .. } => Some(message),
            _ => None,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// JSON client over one API base URL. Cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("donation_client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base: Url::parse(base_url)?,
            token: None,
        })
    }

    /// Same pool and base, with a bearer token attached to every request.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            base: self.base.clone(),
            token: Some(token.into()),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Base URL with `segments` appended, each percent-encoded as one segment.
    /// An empty trailing segment yields a trailing slash.
    pub fn endpoint(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn request(&self, method: Method, segments: &[&str]) -> ApiResult<RequestBuilder> {
        let url = self.endpoint(segments)?;
        debug!("[API] {} {}", method, url);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    /// Sends and unwraps the `{data, message, statusCode}` envelope.
    pub async fn send_enveloped<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        default_error: &str,
    ) -> ApiResult<Envelope<T>> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_body(status, &body, default_error));
        }
        if body.trim().is_empty() {
            return Ok(Envelope {
                message: None,
                status_code: Some(status.as_u16()),
                data: None,
                timestamp: None,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// `data` of the envelope; a `null` payload is an error.
    pub async fn send_data<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        default_error: &str,
    ) -> ApiResult<T> {
        let envelope = self.send_enveloped::<T>(builder, default_error).await?;
        let status = envelope.status_code.unwrap_or(200);
        envelope.data.ok_or_else(|| ApiError::Api {
            status,
            message: envelope
                .message
                .unwrap_or_else(|| default_error.to_string()),
        })
    }

    /// For endpoints that answer with bare JSON instead of an envelope.
    pub async fn send_raw<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        default_error: &str,
    ) -> ApiResult<T> {
        let body = self.send_text(builder, default_error).await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn send_text(&self, builder: RequestBuilder, default_error: &str) -> ApiResult<String> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_body(status, &body, default_error));
        }
        Ok(body)
    }

    /// Only the status matters; the body is discarded.
    pub async fn send_empty(&self, builder: RequestBuilder, default_error: &str) -> ApiResult<()> {
        let response: Response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_from_body(status, &body, default_error))
    }

    pub async fn get<T: DeserializeOwned>(&self, segments: &[&str], default_error: &str) -> ApiResult<T> {
        let builder = self.request(Method::GET, segments)?;
        self.send_data(builder, default_error).await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
        default_error: &str,
    ) -> ApiResult<T> {
        let builder = self.request(Method::POST, segments)?.json(body);
        self.send_data(builder, default_error).await
    }
}

fn error_from_body(status: StatusCode, body: &str, default_error: &str) -> ApiError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| default_error.to_string());
    warn!("[API] {} -> {}", status, message);
    ApiError::Api {
        status: status.as_u16(),
        message,
    }
}
