use std::collections::BTreeMap;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{CallError, Result};

/// Account id used when a call does not name one.
pub const DEFAULT_ACCOUNT: &str = "default";

/// One caller-visible request, possibly realized as several attempts.
#[derive(Clone, Debug)]
pub struct CallRequest {
    /// Tenant the call is made on behalf of.
    pub account_id: String,
    pub method: Method,
    /// Path relative to the base URL, or an absolute `http(s)://` URL.
    pub route: String,
    /// Overrides the orchestrator's base URL for this call.
    pub base: Option<String>,
    /// JSON body.
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    /// Whether credentials are attached to the attempt.
    pub use_auth: bool,
    /// Bearer token used instead of the configured auth provider.
    pub access_token_override: Option<String>,
    /// Cache time-to-live for this call; falls back to the service default.
    pub cache_time_ms: Option<u64>,
    /// Aborts the call at the next suspension point.
    pub cancel: Option<CancellationToken>,
}

impl CallRequest {
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        Self {
            account_id: DEFAULT_ACCOUNT.to_owned(),
            method,
            route: route.into(),
            base: None,
            body: None,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            use_auth: true,
            access_token_override: None,
            cache_time_ms: None,
            cancel: None,
        }
    }

    pub fn get(route: impl Into<String>) -> Self {
        Self::new(Method::GET, route)
    }

    pub fn post(route: impl Into<String>) -> Self {
        Self::new(Method::POST, route)
    }

    pub fn put(route: impl Into<String>) -> Self {
        Self::new(Method::PUT, route)
    }

    pub fn patch(route: impl Into<String>) -> Self {
        Self::new(Method::PATCH, route)
    }

    pub fn delete(route: impl Into<String>) -> Self {
        Self::new(Method::DELETE, route)
    }

    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds a header. Names are stored lower-cased.
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Sends the call without resolving credentials.
    pub fn without_auth(mut self) -> Self {
        self.use_auth = false;
        self
    }

    /// Uses `token` as bearer credential instead of the auth provider.
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token_override = Some(token.into());
        self
    }

    pub fn cache_time_ms(mut self, ttl_ms: u64) -> Self {
        self.cache_time_ms = Some(ttl_ms);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Merges a recovery patch into the request used for the next attempt.
    pub(crate) fn apply(&mut self, patch: RequestPatch) {
        self.headers.extend(
            patch
                .headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value)),
        );
        self.query.extend(patch.query);
        if let Some(body) = patch.body {
            self.body = Some(body);
        }
        if let Some(base) = patch.base {
            self.base = Some(base);
        }
        if let Some(token) = patch.access_token_override {
            self.access_token_override = Some(token);
        }
    }
}

/// Fields a recovery handler wants changed on the next attempt.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestPatch {
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub base: Option<String>,
    pub access_token_override: Option<String>,
}

impl RequestPatch {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token_override = Some(token.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Response of a completed attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct CallResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body; plain text bodies are kept as a JSON string.
    pub body: Value,
}

impl CallResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Value::Null,
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.body)
            .map_err(|err| CallError::Decode(format!("unexpected response body: {err}")))
    }
}
