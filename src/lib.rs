//! `tenantcall-http` orchestrates HTTP calls made on behalf of many accounts.
//!
//! An [`Orchestrator`] wraps a [`Transport`] with:
//! - pluggable authentication ([`AuthProvider`]), including token refresh
//! - response caching keyed by account and request identity
//! - status-code recovery hooks ([`HookSettings`]) with per-account
//!   deduplication of concurrent recoveries
//! - retry backoff honoring `retry-after`
//!
//! ```no_run
//! use tenantcall_http::{CallRequest, HookSettings, Orchestrator};
//!
//! # async fn run() -> tenantcall_http::Result<()> {
//! let api = Orchestrator::builder()
//!     .provider("example")
//!     .base_url("https://api.example.com")
//!     .hook(429, HookSettings::retry().max_retries(3))
//!     .build()?;
//!
//! let response = api.call(CallRequest::get("/v1/items").account("tenant-1")).await?;
//! println!("{}", response.body);
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod auth;
pub mod cache;
pub mod delay;
mod error;
pub mod hooks;
mod options;
mod orchestrator;
mod request;
pub mod scheduler;
pub mod transport;

pub use account::{AccountState, AccountStore, MemoryAccountStore};
pub use auth::{
    ApiKeyHeader, ApiKeyQuery, AuthProvider, BasicAuth, Credential, CredentialStore, TokenAuth,
};
pub use cache::{CacheKey, CacheStore, MemoryCache};
pub use delay::{delay_fn, DelayStrategy, ExponentialJitter, FixedDelay};
pub use error::{AttemptError, BoxError, CallError};
pub use hooks::{HookRegistry, HookSettings, RecoveryHandler};
pub use options::OrchestratorOptions;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, UNAUTHORIZED};
pub use request::{CallRequest, CallResponse, RequestPatch, DEFAULT_ACCOUNT};
pub use scheduler::RetryScheduler;
pub use transport::{HttpTransport, Transport, TransportError, TransportRequest};

pub use reqwest::Method;
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, CallError>;
