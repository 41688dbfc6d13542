//! The physical "send one request" collaborator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Method, Url};
use serde_json::Value;

use crate::{AttemptError, BoxError, CallResponse};

/// Fallback message when neither the body nor the status explain a failure.
const DEFAULT_ERROR_MESSAGE: &str = "request failed";

/// JSON pointers searched, in order, for a human readable error message.
const MESSAGE_POINTERS: &[&str] = &[
    "/error/message",
    "/error_description",
    "/message",
    "/error",
    "/errors/0/message",
    "/detail",
    "/title",
];

/// One fully resolved physical attempt.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

/// Failure of a physical attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server answered with a non-success status.
    #[error(transparent)]
    Status(AttemptError),
    /// No status was received.
    #[error("network failure: {0}")]
    Network(#[source] BoxError),
}

impl TransportError {
    pub fn network(err: impl Into<BoxError>) -> Self {
        Self::Network(err.into())
    }

    /// Builds a status failure from `response`, extracting its message.
    pub fn from_response(response: CallResponse) -> Self {
        let message = extract_error_message(&response);
        Self::Status(AttemptError::new(response.status, message, response))
    }
}

/// Sends a single request. Implementations must not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<CallResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: TransportRequest) -> Result<CallResponse, TransportError> {
        (**self).send(request).await
    }
}

/// [`Transport`] backed by `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), timeout)
    }

    pub fn with_client(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<CallResponse, TransportError> {
        let mut builder = self
            .http
            .request(request.method, request.url)
            .timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.header(header::CONTENT_TYPE, "application/json").json(body);
        }

        let response = builder.send().await.map_err(TransportError::network)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect();
        let text = response.text().await.map_err(TransportError::network)?;

        let response = CallResponse {
            status: status.as_u16(),
            headers,
            body: parse_body(&text),
        };
        if !status.is_success() {
            return Err(TransportError::from_response(response));
        }
        Ok(response)
    }
}

/// JSON bodies are parsed; anything else is kept as text.
pub(crate) fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}

/// First non-empty message in conventional error body locations, then the
/// status reason phrase, then a generic default.
pub fn extract_error_message(response: &CallResponse) -> String {
    let from_body = MESSAGE_POINTERS
        .iter()
        .filter_map(|pointer| response.body.pointer(pointer))
        .chain(std::iter::once(&response.body))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|message| !message.is_empty());
    if let Some(message) = from_body {
        return message.to_owned();
    }

    reqwest::StatusCode::from_u16(response.status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or(DEFAULT_ERROR_MESSAGE)
        .to_owned()
}
