use std::sync::Arc;

use crate::CallResponse;

/// Boxed error returned by collaborators (auth providers, handlers, stores).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A physical attempt that completed with a non-success HTTP status.
///
/// `status` is the classifier used to look up a recovery hook.
#[derive(Clone, Debug, thiserror::Error)]
#[error("http error {status}: {message}")]
pub struct AttemptError {
    /// HTTP status code of the failed attempt.
    pub status: u16,
    /// Best-effort human readable message extracted from the response.
    pub message: String,
    /// Raw response of the failed attempt.
    pub response: CallResponse,
}

impl AttemptError {
    pub fn new(status: u16, message: impl Into<String>, response: CallResponse) -> Self {
        Self {
            status,
            message: message.into(),
            response,
        }
    }
}

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Non-success HTTP status with no hook willing to recover it.
    #[error(transparent)]
    Http(#[from] AttemptError),
    /// The request never produced a status (connect, timeout, body read).
    #[error("network failure: {0}")]
    Network(#[source] BoxError),
    /// Authentication was required but the provider resolved nothing.
    #[error("no credentials available for account '{account_id}'")]
    AuthenticationMissing { account_id: String },
    /// The auth provider itself failed while resolving credentials.
    #[error("credential resolution failed for account '{account_id}': {source}")]
    Auth {
        account_id: String,
        #[source]
        source: BoxError,
    },
    /// The retry budget of the classifier was spent.
    #[error("recovery for status {status} exhausted after {retries} retries")]
    RecoveryExhausted {
        status: u16,
        retries: u32,
        /// The error of the last attempt.
        #[source]
        last: AttemptError,
    },
    /// The recovery handler of the classifier failed.
    #[error("recovery handler for status {status} failed: {source}")]
    RecoveryHandlerFailed {
        status: u16,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    /// Safety-net ceiling on physical attempts per logical call.
    #[error("exceeded maximum attempts ({attempts})")]
    GlobalAttemptsExceeded {
        attempts: u32,
        #[source]
        last: AttemptError,
    },
    /// The call's cancellation token fired.
    #[error("call cancelled")]
    Cancelled,
    /// The request could not be turned into a valid URL or header set.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Invalid setup-time configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Response body did not match the requested type.
    #[error("decode error: {0}")]
    Decode(String),
}

impl CallError {
    /// HTTP status behind this error, if the failure was classifiable.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http(err) => Some(err.status),
            Self::RecoveryExhausted { status, .. } | Self::RecoveryHandlerFailed { status, .. } => {
                Some(*status)
            }
            Self::GlobalAttemptsExceeded { last, .. } => Some(last.status),
            _ => None,
        }
    }

    /// Response of the last failed attempt, when there was one.
    pub fn response(&self) -> Option<&CallResponse> {
        match self {
            Self::Http(err) => Some(&err.response),
            Self::RecoveryExhausted { last, .. } | Self::GlobalAttemptsExceeded { last, .. } => {
                Some(&last.response)
            }
            _ => None,
        }
    }
}
