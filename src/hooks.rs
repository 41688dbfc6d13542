//! Status-code driven recovery hooks.
//!
//! Each HTTP status (the classifier) may carry a [`HookSettings`] that says
//! whether failures of that class are retried, how long to wait, and which
//! handler repairs the request (for example by refreshing credentials) before
//! the next attempt.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::{delay::DelayStrategy, AttemptError, BoxError, CallError, RequestPatch, Result};

/// Best-effort side callback. Errors it returns are logged and dropped.
pub type FailureCallback = Arc<
    dyn Fn(&str, &(dyn std::error::Error + 'static)) -> std::result::Result<(), BoxError>
        + Send
        + Sync,
>;

type SharedError = Arc<dyn std::error::Error + Send + Sync>;
type PendingRecovery = Shared<BoxFuture<'static, std::result::Result<RequestPatch, SharedError>>>;
type InFlightMap = HashMap<(String, u16), InFlight>;

struct InFlight {
    id: u64,
    pending: PendingRecovery,
}

/// Owned by a spawned recovery; drops its registry entry when the execution
/// ends, whether it returned or panicked.
struct InFlightEntry {
    in_flight: Arc<Mutex<InFlightMap>>,
    key: (String, u16),
    id: u64,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

fn lock(in_flight: &Mutex<InFlightMap>) -> MutexGuard<'_, InFlightMap> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Repairs a classified failure before the next attempt.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn recover(
        &self,
        account_id: &str,
        failure: &AttemptError,
    ) -> std::result::Result<RequestPatch, BoxError>;
}

/// Closure-backed handler, see [`HookSettings::with_handler`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> RecoveryHandler for HandlerFn<F>
where
    F: Fn(String, AttemptError) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<RequestPatch, BoxError>> + Send + 'static,
{
    async fn recover(
        &self,
        account_id: &str,
        failure: &AttemptError,
    ) -> std::result::Result<RequestPatch, BoxError> {
        (self.0)(account_id.to_owned(), failure.clone()).await
    }
}

/// Recovery policy for one classifier.
#[derive(Clone)]
pub struct HookSettings {
    /// When false the classifier is informational and always propagates.
    pub should_retry: bool,
    /// Whether to back off before the next attempt.
    pub use_delay: bool,
    /// Retry ceiling for this classifier; falls back to the service default.
    pub max_retries: Option<u32>,
    /// At most one handler execution per (account, classifier) at a time.
    pub prevent_concurrent_recovery: bool,
    pub handler: Option<Arc<dyn RecoveryHandler>>,
    pub on_recovery_exhausted: Option<FailureCallback>,
    pub on_handler_failure: Option<FailureCallback>,
    pub delay_strategy: Option<Arc<dyn DelayStrategy>>,
    pub max_delay: Option<Duration>,
}

impl fmt::Debug for HookSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSettings")
            .field("should_retry", &self.should_retry)
            .field("use_delay", &self.use_delay)
            .field("max_retries", &self.max_retries)
            .field("prevent_concurrent_recovery", &self.prevent_concurrent_recovery)
            .field("handler", &self.handler.is_some())
            .field("delay_strategy", &self.delay_strategy.is_some())
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl HookSettings {
    /// Retries with backoff and no handler.
    pub fn retry() -> Self {
        Self {
            should_retry: true,
            use_delay: true,
            max_retries: None,
            prevent_concurrent_recovery: false,
            handler: None,
            on_recovery_exhausted: None,
            on_handler_failure: None,
            delay_strategy: None,
            max_delay: None,
        }
    }

    /// Never retries; the classifier only carries callbacks.
    pub fn informational() -> Self {
        Self {
            should_retry: false,
            use_delay: false,
            ..Self::retry()
        }
    }

    pub fn without_delay(mut self) -> Self {
        self.use_delay = false;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn prevent_concurrent_recovery(mut self) -> Self {
        self.prevent_concurrent_recovery = true;
        self
    }

    /// Installs an async closure as recovery handler.
    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(String, AttemptError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<RequestPatch, BoxError>> + Send + 'static,
    {
        self.handler = Some(Arc::new(HandlerFn(handler)));
        self
    }

    pub fn with_recovery(mut self, handler: impl RecoveryHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn on_recovery_exhausted<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &(dyn std::error::Error + 'static)) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.on_recovery_exhausted = Some(Arc::new(callback));
        self
    }

    pub fn on_handler_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &(dyn std::error::Error + 'static)) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.on_handler_failure = Some(Arc::new(callback));
        self
    }

    pub fn delay_strategy(mut self, strategy: impl DelayStrategy + 'static) -> Self {
        self.delay_strategy = Some(Arc::new(strategy));
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    fn validate(&self, status: u16) -> Result<()> {
        if !(100..=599).contains(&status) {
            return Err(CallError::Config(format!(
                "hook classifier {status} is not an HTTP status code"
            )));
        }
        if !self.should_retry && self.handler.is_some() {
            return Err(CallError::Config(format!(
                "hook for status {status} has a handler but never retries"
            )));
        }
        if self.max_delay.is_some_and(|max_delay| max_delay.is_zero()) {
            return Err(CallError::Config(format!(
                "hook for status {status} has a zero max_delay"
            )));
        }
        Ok(())
    }
}

/// Classifier to hook table plus in-flight recovery bookkeeping.
pub struct HookRegistry {
    hooks: HashMap<u16, HookSettings>,
    in_flight: Arc<Mutex<InFlightMap>>,
    next_id: AtomicU64,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classifiers: Vec<_> = self.hooks.keys().copied().collect();
        classifiers.sort_unstable();
        f.debug_struct("HookRegistry")
            .field("classifiers", &classifiers)
            .finish_non_exhaustive()
    }
}

impl HookRegistry {
    /// Builds a registry, validating every entry.
    pub fn new(hooks: HashMap<u16, HookSettings>) -> Result<Self> {
        for (status, hook) in &hooks {
            hook.validate(*status)?;
        }
        Ok(Self {
            hooks,
            in_flight: Arc::default(),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn get(&self, status: u16) -> Option<&HookSettings> {
        self.hooks.get(&status)
    }

    /// False when no hook exists or the hook is informational.
    pub fn should_retry(&self, status: u16) -> bool {
        self.retrying(status).is_some()
    }

    /// The hook for `status` if it opts into retries.
    pub fn retrying(&self, status: u16) -> Option<&HookSettings> {
        self.hooks.get(&status).filter(|hook| hook.should_retry)
    }

    /// Effective retry ceiling for `status`.
    pub fn max_retries(&self, status: u16, default: u32) -> u32 {
        self.hooks
            .get(&status)
            .and_then(|hook| hook.max_retries)
            .unwrap_or(default)
    }

    /// Runs the recovery handler for `failure`.
    ///
    /// With `prevent_concurrent_recovery`, callers for the same
    /// (account, status) share one execution while it is in flight. That
    /// execution runs on its own task: it completes and leaves the registry
    /// even when every caller waiting on it is cancelled or dropped.
    ///
    /// # Panics
    ///
    /// Deduplicated recovery must be called from within a Tokio runtime.
    pub async fn recover(&self, account_id: &str, failure: &AttemptError) -> Result<RequestPatch> {
        let status = failure.status;
        let Some(hook) = self.retrying(status) else {
            return Ok(RequestPatch::default());
        };
        let Some(handler) = hook.handler.clone() else {
            return Ok(RequestPatch::default());
        };
        let on_failure = hook.on_handler_failure.clone();

        let outcome = if hook.prevent_concurrent_recovery {
            let key = (account_id.to_owned(), status);
            let pending = {
                let mut in_flight = lock(&self.in_flight);
                match in_flight.get(&key) {
                    Some(entry) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(account_id, status, "joining in-flight recovery");
                        entry.pending.clone()
                    }
                    None => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let entry = InFlightEntry {
                            in_flight: Arc::clone(&self.in_flight),
                            key: key.clone(),
                            id,
                        };
                        let task = tokio::spawn(execute(
                            handler,
                            on_failure,
                            account_id.to_owned(),
                            failure.clone(),
                            Some(entry),
                        ));
                        let pending = async move {
                            task.await.unwrap_or_else(|err| Err(Arc::new(err) as SharedError))
                        }
                        .boxed()
                        .shared();
                        in_flight.insert(
                            key,
                            InFlight {
                                id,
                                pending: pending.clone(),
                            },
                        );
                        pending
                    }
                }
            };
            pending.await
        } else {
            execute(handler, on_failure, account_id.to_owned(), failure.clone(), None).await
        };

        outcome.map_err(|source| CallError::RecoveryHandlerFailed { status, source })
    }

    /// Fires `on_recovery_exhausted` for the classifier of `failure`.
    pub fn notify_exhausted(&self, account_id: &str, failure: &AttemptError) {
        let callback = self
            .hooks
            .get(&failure.status)
            .and_then(|hook| hook.on_recovery_exhausted.as_ref());
        if let Some(callback) = callback {
            if let Err(err) = callback(account_id, failure) {
                report_callback_error("recovery-exhausted", account_id, failure.status, &err);
            }
        }
    }

    /// Number of recoveries currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

async fn execute(
    handler: Arc<dyn RecoveryHandler>,
    on_failure: Option<FailureCallback>,
    account_id: String,
    failure: AttemptError,
    _entry: Option<InFlightEntry>,
) -> std::result::Result<RequestPatch, SharedError> {
    #[cfg(feature = "tracing")]
    tracing::debug!(account_id = %account_id, status = failure.status, "running recovery handler");
    match handler.recover(&account_id, &failure).await {
        Ok(patch) => Ok(patch),
        Err(err) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                account_id = %account_id,
                status = failure.status,
                error = %err,
                "recovery handler failed"
            );
            if let Some(callback) = on_failure {
                if let Err(callback_err) = callback(&account_id, &*err) {
                    report_callback_error(
                        "handler-failure",
                        &account_id,
                        failure.status,
                        &callback_err,
                    );
                }
            }
            Err(Arc::from(err))
        }
    }
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn report_callback_error(callback: &str, account_id: &str, status: u16, err: &BoxError) {
    #[cfg(feature = "tracing")]
    tracing::warn!(callback, account_id, status, error = %err, "side callback failed");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{HookRegistry, HookSettings};
    use crate::{AttemptError, BoxError, CallError, CallResponse, RequestPatch};

    fn failure(status: u16) -> AttemptError {
        AttemptError::new(status, "failed", CallResponse::new(status))
    }

    fn counting_hook(calls: Arc<AtomicUsize>) -> HookSettings {
        HookSettings::retry()
            .prevent_concurrent_recovery()
            .with_handler(move |_account, _failure| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, BoxError>(RequestPatch::default().header("x-refreshed", "1"))
                }
            })
    }

    #[test]
    fn should_retry_requires_opt_in() {
        let registry = HookRegistry::new(HashMap::from([
            (429, HookSettings::retry()),
            (404, HookSettings::informational()),
        ]))
        .expect("registry must build");
        assert!(registry.should_retry(429));
        assert!(!registry.should_retry(404));
        assert!(!registry.should_retry(500));
    }

    #[test]
    fn max_retries_falls_back_to_default() {
        let registry = HookRegistry::new(HashMap::from([
            (429, HookSettings::retry().max_retries(2)),
            (503, HookSettings::retry()),
        ]))
        .expect("registry must build");
        assert_eq!(registry.max_retries(429, 4), 2);
        assert_eq!(registry.max_retries(503, 4), 4);
    }

    #[test]
    fn setup_rejects_invalid_hooks() {
        let err = HookRegistry::new(HashMap::from([(42, HookSettings::retry())]))
            .expect_err("classifier must be an HTTP status");
        assert!(matches!(err, CallError::Config(_)));

        let informational_with_handler = HookSettings::informational()
            .with_handler(|_, _| async { Ok::<_, BoxError>(RequestPatch::default()) });
        assert!(HookRegistry::new(HashMap::from([(401, informational_with_handler)])).is_err());

        let zero_cap = HookSettings::retry().max_delay(Duration::ZERO);
        assert!(HookRegistry::new(HashMap::from([(503, zero_cap)])).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_recoveries_share_one_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry =
            HookRegistry::new(HashMap::from([(401, counting_hook(calls.clone()))])).unwrap();

        let first = failure(401);
        let second = failure(401);
        let (a, b) = tokio::join!(
            registry.recover("acct", &first),
            registry.recover("acct", &second)
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn different_accounts_recover_independently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry =
            HookRegistry::new(HashMap::from([(401, counting_hook(calls.clone()))])).unwrap();

        let first = failure(401);
        let second = failure(401);
        let (a, b) = tokio::join!(
            registry.recover("acct-a", &first),
            registry.recover("acct-b", &second)
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_recovery_finishes_and_clears_its_entry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry =
            HookRegistry::new(HashMap::from([(401, counting_hook(calls.clone()))])).unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            registry.recover("acct", &failure(401)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(registry.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.in_flight(), 0);

        registry.recover("acct", &failure(401)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_recoveries_start_fresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry =
            HookRegistry::new(HashMap::from([(401, counting_hook(calls.clone()))])).unwrap();

        registry.recover("acct", &failure(401)).await.unwrap();
        registry.recover("acct", &failure(401)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handler_failure_fires_callback_and_propagates() {
        let callbacks = Arc::new(AtomicUsize::new(0));
        let seen = callbacks.clone();
        let hook = HookSettings::retry()
            .with_handler(|_, _| async { Err::<RequestPatch, BoxError>("refresh rejected".into()) })
            .on_handler_failure(move |account, err| {
                assert_eq!(account, "acct");
                assert_eq!(err.to_string(), "refresh rejected");
                seen.fetch_add(1, Ordering::SeqCst);
                Err("callback broke too".into())
            });
        let registry = HookRegistry::new(HashMap::from([(401, hook)])).unwrap();

        let err = registry
            .recover("acct", &failure(401))
            .await
            .expect_err("handler error must propagate");
        match err {
            CallError::RecoveryHandlerFailed { status, source } => {
                assert_eq!(status, 401);
                assert_eq!(source.to_string(), "refresh rejected");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn informational_hook_never_runs_handler() {
        let registry =
            HookRegistry::new(HashMap::from([(404, HookSettings::informational())])).unwrap();
        let patch = registry.recover("acct", &failure(404)).await.unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn exhausted_callback_errors_are_swallowed() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        let hook = HookSettings::retry().on_recovery_exhausted(move |_, err| {
            assert!(err.to_string().contains("429"));
            seen.fetch_add(1, Ordering::SeqCst);
            Err("ignored".into())
        });
        let registry = HookRegistry::new(HashMap::from([(429, hook)])).unwrap();
        registry.notify_exhausted("acct", &failure(429));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
