//! Authentication providers.
//!
//! A provider supplies the headers (or query parameters) attached to each
//! attempt. Providers that can renew credentials report
//! [`AuthProvider::supports_refresh`], which makes the orchestrator install a
//! default recovery hook for `401 Unauthorized`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::BoxError;

/// Header name to value, names lower-cased.
pub type AuthHeaders = BTreeMap<String, String>;

/// Source of per-attempt credentials.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Headers for an attempt on behalf of `account_id`. May be empty.
    async fn auth_headers(&self, account_id: &str) -> Result<AuthHeaders, BoxError>;

    /// Query parameters injected into the URL instead of headers.
    fn query_params(&self, _account_id: &str) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn supports_refresh(&self) -> bool {
        false
    }

    /// Renews the credential of `account_id`.
    async fn refresh(&self, account_id: &str) -> Result<Credential, BoxError> {
        Err(format!("credential refresh is not supported (account '{account_id}')").into())
    }
}

#[async_trait]
impl<T: AuthProvider + ?Sized> AuthProvider for Arc<T> {
    async fn auth_headers(&self, account_id: &str) -> Result<AuthHeaders, BoxError> {
        (**self).auth_headers(account_id).await
    }

    fn query_params(&self, account_id: &str) -> BTreeMap<String, String> {
        (**self).query_params(account_id)
    }

    fn supports_refresh(&self) -> bool {
        (**self).supports_refresh()
    }

    async fn refresh(&self, account_id: &str) -> Result<Credential, BoxError> {
        (**self).refresh(account_id).await
    }
}

/// Access/refresh token pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// External storage backing [`TokenAuth`].
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, account_id: &str) -> Result<Option<Credential>, BoxError>;

    async fn set(&self, account_id: &str, credential: Credential) -> Result<(), BoxError>;

    /// Exchanges `refresh_token` for a new credential.
    async fn refresh(&self, refresh_token: &str, account_id: &str) -> Result<Credential, BoxError>;
}

/// Bearer tokens kept in a [`CredentialStore`], refreshable.
pub struct TokenAuth<S> {
    store: S,
}

impl<S> TokenAuth<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> fmt::Debug for TokenAuth<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuth").finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: CredentialStore> AuthProvider for TokenAuth<S> {
    async fn auth_headers(&self, account_id: &str) -> Result<AuthHeaders, BoxError> {
        let Some(credential) = self.store.get(account_id).await? else {
            return Ok(AuthHeaders::new());
        };
        Ok(AuthHeaders::from([(
            "authorization".to_owned(),
            bearer(&credential.access_token),
        )]))
    }

    fn supports_refresh(&self) -> bool {
        true
    }

    async fn refresh(&self, account_id: &str) -> Result<Credential, BoxError> {
        let current = self
            .store
            .get(account_id)
            .await?
            .ok_or_else(|| format!("no credential stored for account '{account_id}'"))?;
        let refresh_token = current
            .refresh_token
            .ok_or_else(|| format!("no refresh token stored for account '{account_id}'"))?;

        let mut renewed = self.store.refresh(&refresh_token, account_id).await?;
        if renewed.refresh_token.is_none() {
            renewed.refresh_token = Some(refresh_token);
        }
        self.store.set(account_id, renewed.clone()).await?;
        #[cfg(feature = "tracing")]
        tracing::debug!(account_id, "credential refreshed");
        Ok(renewed)
    }
}

/// Static API key sent in a header.
#[derive(Clone)]
pub struct ApiKeyHeader {
    header: String,
    key: String,
}

impl ApiKeyHeader {
    pub fn new(header: impl AsRef<str>, key: impl Into<String>) -> Self {
        Self {
            header: header.as_ref().to_ascii_lowercase(),
            key: key.into(),
        }
    }
}

impl fmt::Debug for ApiKeyHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyHeader")
            .field("header", &self.header)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AuthProvider for ApiKeyHeader {
    async fn auth_headers(&self, _account_id: &str) -> Result<AuthHeaders, BoxError> {
        Ok(AuthHeaders::from([(self.header.clone(), self.key.clone())]))
    }
}

/// Static API key sent as a query parameter.
#[derive(Clone)]
pub struct ApiKeyQuery {
    param: String,
    key: String,
}

impl ApiKeyQuery {
    pub fn new(param: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            key: key.into(),
        }
    }
}

impl fmt::Debug for ApiKeyQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyQuery")
            .field("param", &self.param)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AuthProvider for ApiKeyQuery {
    async fn auth_headers(&self, _account_id: &str) -> Result<AuthHeaders, BoxError> {
        Ok(AuthHeaders::new())
    }

    fn query_params(&self, _account_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(self.param.clone(), self.key.clone())])
    }
}

/// HTTP basic credentials.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn header_value(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {token}")
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AuthProvider for BasicAuth {
    async fn auth_headers(&self, _account_id: &str) -> Result<AuthHeaders, BoxError> {
        Ok(AuthHeaders::from([(
            "authorization".to_owned(),
            self.header_value(),
        )]))
    }
}

/// Formats a bearer authorization value, keeping an existing scheme prefix.
pub(crate) fn bearer(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}
