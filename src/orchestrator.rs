use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{
    account::{AccountState, AccountStore, MemoryAccountStore},
    auth::{bearer, AuthProvider},
    cache::{CacheKey, CacheStore, MemoryCache},
    delay::DelayStrategy,
    hooks::{HookRegistry, HookSettings, RecoveryHandler},
    scheduler::RetryScheduler,
    transport::{HttpTransport, Transport, TransportError, TransportRequest},
    AttemptError, BoxError, CallError, CallRequest, CallResponse, OrchestratorOptions,
    RequestPatch, Result,
};

/// Classifier of the auth-expiry hook installed for refreshable providers.
pub const UNAUTHORIZED: u16 = 401;

/// Drives logical calls through auth, caching, recovery hooks and backoff.
pub struct Orchestrator {
    provider: String,
    options: OrchestratorOptions,
    transport: Arc<dyn Transport>,
    auth: Option<Arc<dyn AuthProvider>>,
    hooks: HookRegistry,
    scheduler: RetryScheduler,
    cache: Arc<dyn CacheStore>,
    accounts: Arc<dyn AccountStore>,
    default_headers: BTreeMap<String, String>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provider", &self.provider)
            .field("options", &self.options)
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .field("hooks", &self.hooks)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Name of the API this orchestrator talks to, used in logs.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Outcome bookkeeping of `account_id`.
    pub fn account_state(&self, account_id: &str) -> AccountState {
        self.accounts.get(account_id)
    }

    /// Runs one logical call.
    ///
    /// Returns a cached response when a live entry exists; otherwise attempts
    /// the request, recovering classified failures through the hook table,
    /// and records the outcome for the account.
    pub async fn call(&self, request: CallRequest) -> Result<CallResponse> {
        let ttl_ms = request.cache_time_ms.unwrap_or(self.options.cache_time_ms);
        let cache_key =
            (ttl_ms > 0).then(|| CacheKey::for_request(&request, self.resolve_base(&request)));

        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key, Duration::from_millis(ttl_ms)) {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    provider = %self.provider,
                    account_id = %request.account_id,
                    route = %request.route,
                    "cache hit"
                );
                return Ok(hit);
            }
        }

        let account_id = request.account_id.clone();
        let outcome = self.drive(request).await;
        self.accounts.record(&account_id, outcome.is_err());

        let response = outcome?;
        if let Some(key) = cache_key {
            self.cache.put(key, response.clone(), Duration::from_millis(ttl_ms));
        }
        Ok(response)
    }

    /// Runs `request` and decodes the response body into `T`.
    pub async fn call_json<T: DeserializeOwned>(&self, request: CallRequest) -> Result<T> {
        self.call(request).await?.json()
    }

    pub async fn get(&self, route: impl Into<String>) -> Result<CallResponse> {
        self.call(CallRequest::get(route)).await
    }

    pub async fn post(
        &self,
        route: impl Into<String>,
        body: serde_json::Value,
    ) -> Result<CallResponse> {
        self.call(CallRequest::post(route).json(body)).await
    }

    pub async fn put(
        &self,
        route: impl Into<String>,
        body: serde_json::Value,
    ) -> Result<CallResponse> {
        self.call(CallRequest::put(route).json(body)).await
    }

    pub async fn patch(
        &self,
        route: impl Into<String>,
        body: serde_json::Value,
    ) -> Result<CallResponse> {
        self.call(CallRequest::patch(route).json(body)).await
    }

    pub async fn delete(&self, route: impl Into<String>) -> Result<CallResponse> {
        self.call(CallRequest::delete(route)).await
    }

    /// Attempt loop of one logical call.
    async fn drive(&self, mut request: CallRequest) -> Result<CallResponse> {
        let cancel = request.cancel.clone();
        let mut retries: HashMap<u16, u32> = HashMap::new();
        let mut attempts = 0u32;

        loop {
            let prepared = until_cancelled(cancel.as_ref(), self.prepare(&request)).await??;
            attempts += 1;
            #[cfg(feature = "tracing")]
            tracing::debug!(
                provider = %self.provider,
                account_id = %request.account_id,
                method = %prepared.method,
                route = %request.route,
                attempt = attempts,
                "sending request"
            );

            let sent = until_cancelled(cancel.as_ref(), self.transport.send(prepared)).await?;
            let failure = match sent {
                Ok(response) => return Ok(response),
                Err(TransportError::Network(err)) => return Err(CallError::Network(err)),
                Err(TransportError::Status(failure)) => failure,
            };

            let status = failure.status;
            let Some(hook) = self.hooks.retrying(status) else {
                return Err(failure.into());
            };

            let counter = retries.entry(status).or_insert(0);
            *counter += 1;
            let retry = *counter;

            let ceiling = self
                .hooks
                .max_retries(status, self.scheduler.default_max_retries());
            if retry > ceiling {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    provider = %self.provider,
                    account_id = %request.account_id,
                    status,
                    retries = ceiling,
                    "recovery exhausted"
                );
                self.hooks.notify_exhausted(&request.account_id, &failure);
                return Err(CallError::RecoveryExhausted {
                    status,
                    retries: ceiling,
                    last: failure,
                });
            }

            if attempts >= self.options.max_attempts {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    provider = %self.provider,
                    account_id = %request.account_id,
                    status,
                    attempts,
                    "maximum attempts exceeded"
                );
                return Err(CallError::GlobalAttemptsExceeded {
                    attempts,
                    last: failure,
                });
            }

            let patch = until_cancelled(
                cancel.as_ref(),
                self.hooks.recover(&request.account_id, &failure),
            )
            .await??;
            request.apply(patch);

            if hook.use_delay {
                let delay = self.scheduler.delay_for(
                    retry,
                    Some(&failure.response),
                    hook.delay_strategy.as_ref(),
                    hook.max_delay,
                );
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    provider = %self.provider,
                    account_id = %request.account_id,
                    status,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                self.scheduler.suspend(delay, cancel.as_ref()).await?;
            }
        }
    }

    /// Resolves credentials and builds the physical request.
    async fn prepare(&self, request: &CallRequest) -> Result<TransportRequest> {
        let mut headers = self.default_headers.clone();
        headers.extend(request.headers.clone());
        let mut query = request.query.clone();

        if request.use_auth {
            if let Some(token) = &request.access_token_override {
                headers.insert("authorization".to_owned(), bearer(token));
            } else if let Some(auth) = &self.auth {
                let resolved = auth
                    .auth_headers(&request.account_id)
                    .await
                    .map_err(|source| CallError::Auth {
                        account_id: request.account_id.clone(),
                        source,
                    })?;
                let injected = auth.query_params(&request.account_id);
                if resolved.is_empty() && injected.is_empty() {
                    return Err(CallError::AuthenticationMissing {
                        account_id: request.account_id.clone(),
                    });
                }
                headers.extend(resolved);
                query.extend(injected);
            }
        }

        let url = build_url(self.resolve_base(request), &request.route, &query)?;
        Ok(TransportRequest {
            method: request.method.clone(),
            url,
            headers,
            body: request.body.clone(),
        })
    }

    fn resolve_base<'a>(&'a self, request: &'a CallRequest) -> Option<&'a str> {
        request
            .base
            .as_deref()
            .or(self.options.base_url.as_deref())
    }
}

/// Races `future` against `cancel`; refuses to start once cancelled.
async fn until_cancelled<F: Future>(
    cancel: Option<&CancellationToken>,
    future: F,
) -> Result<F::Output> {
    let Some(token) = cancel else {
        return Ok(future.await);
    };
    if token.is_cancelled() {
        return Err(CallError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CallError::Cancelled),
        output = future => Ok(output),
    }
}

fn build_url(base: Option<&str>, route: &str, query: &BTreeMap<String, String>) -> Result<Url> {
    let raw = if route.starts_with("http://") || route.starts_with("https://") {
        route.to_owned()
    } else {
        let base = base.ok_or_else(|| {
            CallError::InvalidRequest(format!(
                "route '{route}' is relative and no base URL is configured"
            ))
        })?;
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            route.trim_start_matches('/')
        )
    };

    let mut url = Url::parse(&raw)
        .map_err(|err| CallError::InvalidRequest(format!("invalid url '{raw}': {err}")))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query.iter());
    }
    Ok(url)
}

/// Default recovery for auth expiry: refresh, then retry with fresh headers.
struct RefreshCredentials {
    auth: Arc<dyn AuthProvider>,
}

#[async_trait]
impl RecoveryHandler for RefreshCredentials {
    async fn recover(
        &self,
        account_id: &str,
        _failure: &AttemptError,
    ) -> std::result::Result<RequestPatch, BoxError> {
        self.auth.refresh(account_id).await?;
        Ok(RequestPatch::default())
    }
}

fn refresh_hook(auth: Arc<dyn AuthProvider>) -> HookSettings {
    HookSettings::retry()
        .max_retries(1)
        .prevent_concurrent_recovery()
        .with_recovery(RefreshCredentials { auth })
}

/// Setup-time configuration of an [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    provider: Option<String>,
    options: OrchestratorOptions,
    transport: Option<Arc<dyn Transport>>,
    auth: Option<Arc<dyn AuthProvider>>,
    hooks: HashMap<u16, Option<HookSettings>>,
    delay_strategy: Option<Arc<dyn DelayStrategy>>,
    cache: Option<Arc<dyn CacheStore>>,
    accounts: Option<Arc<dyn AccountStore>>,
    default_headers: BTreeMap<String, String>,
}

impl OrchestratorBuilder {
    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.provider = Some(name.into());
        self
    }

    pub fn options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.options.base_url = Some(base_url.into());
        self
    }

    pub fn cache_time_ms(mut self, ttl_ms: u64) -> Self {
        self.options.cache_time_ms = ttl_ms;
        self
    }

    /// Replaces the default `reqwest` transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn auth(mut self, auth: impl AuthProvider + 'static) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Registers the recovery hook for `status`.
    pub fn hook(mut self, status: u16, settings: HookSettings) -> Self {
        self.hooks.insert(status, Some(settings));
        self
    }

    /// Registers an explicit "no hook" for `status`, which also suppresses
    /// the default auth-refresh hook when `status` is 401.
    pub fn disable_hook(mut self, status: u16) -> Self {
        self.hooks.insert(status, None);
        self
    }

    /// Service-wide backoff strategy for hooks without their own.
    pub fn delay_strategy(mut self, strategy: impl DelayStrategy + 'static) -> Self {
        self.delay_strategy = Some(Arc::new(strategy));
        self
    }

    pub fn cache_store(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn account_store(mut self, accounts: Arc<dyn AccountStore>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    /// Header sent with every attempt; per-call headers take precedence.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.default_headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.options.validate()?;
        if let Some(base_url) = &self.options.base_url {
            Url::parse(base_url)
                .map_err(|err| CallError::Config(format!("invalid base url '{base_url}': {err}")))?;
        }

        let install_refresh = self
            .auth
            .as_ref()
            .is_some_and(|auth| auth.supports_refresh())
            && !self.hooks.contains_key(&UNAUTHORIZED);

        let mut hooks: HashMap<u16, HookSettings> = self
            .hooks
            .into_iter()
            .filter_map(|(status, settings)| settings.map(|settings| (status, settings)))
            .collect();
        if install_refresh {
            if let Some(auth) = &self.auth {
                hooks.insert(UNAUTHORIZED, refresh_hook(auth.clone()));
            }
        }

        let mut scheduler = RetryScheduler::new(
            self.options.max_retries,
            Duration::from_millis(self.options.max_delay_ms),
        );
        if let Some(strategy) = self.delay_strategy {
            scheduler = scheduler.with_strategy(strategy);
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(Duration::from_millis(
                self.options.timeout_ms,
            ))),
        };
        let cache: Arc<dyn CacheStore> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(MemoryCache::new()),
        };
        let accounts: Arc<dyn AccountStore> = match self.accounts {
            Some(accounts) => accounts,
            None => Arc::new(MemoryAccountStore::new()),
        };

        Ok(Orchestrator {
            provider: self.provider.unwrap_or_else(|| "http".to_owned()),
            hooks: HookRegistry::new(hooks)?,
            scheduler,
            transport,
            auth: self.auth,
            cache,
            accounts,
            default_headers: self.default_headers,
            options: self.options,
        })
    }
}
