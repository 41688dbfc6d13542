use crate::{CallError, Result};

/// Configures timeouts, retry ceilings, backoff caps and caching.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OrchestratorOptions {
    /// Per-attempt timeout of the default transport, in milliseconds.
    pub timeout_ms: u64,
    /// Retry ceiling for classifiers that do not set their own.
    pub max_retries: u32,
    /// Upper bound on any backoff delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Physical attempts per logical call, across all classifiers.
    pub max_attempts: u32,
    /// Default cache time-to-live; `0` disables caching.
    pub cache_time_ms: u64,
    /// Base URL that relative routes are joined onto.
    pub base_url: Option<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 4,
            max_delay_ms: 60_000,
            max_attempts: 10,
            cache_time_ms: 0,
            base_url: None,
        }
    }
}

impl OrchestratorOptions {
    /// Reads options from the environment on top of the defaults.
    ///
    /// Recognized variables:
    /// - `TENANTCALL_BASE_URL`
    /// - `TENANTCALL_TIMEOUT_MS`
    /// - `TENANTCALL_MAX_RETRIES`
    /// - `TENANTCALL_MAX_DELAY_MS`
    /// - `TENANTCALL_MAX_ATTEMPTS`
    /// - `TENANTCALL_CACHE_TIME_MS`
    ///
    /// Unset variables keep their default; unparsable values are an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();

        if let Some(url) = lookup("TENANTCALL_BASE_URL") {
            if url.trim().is_empty() {
                return Err(CallError::Config(
                    "TENANTCALL_BASE_URL is set but empty".to_owned(),
                ));
            }
            options.base_url = Some(url.trim().to_owned());
        }
        if let Some(value) = parse_var(&lookup, "TENANTCALL_TIMEOUT_MS")? {
            options.timeout_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "TENANTCALL_MAX_RETRIES")? {
            options.max_retries = value;
        }
        if let Some(value) = parse_var(&lookup, "TENANTCALL_MAX_DELAY_MS")? {
            options.max_delay_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "TENANTCALL_MAX_ATTEMPTS")? {
            options.max_attempts = value;
        }
        if let Some(value) = parse_var(&lookup, "TENANTCALL_CACHE_TIME_MS")? {
            options.cache_time_ms = value;
        }

        options.validate()?;
        Ok(options)
    }

    /// Rejects settings that would make every call fail.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CallError::Config("max_attempts must be at least 1".to_owned()));
        }
        if self.timeout_ms == 0 {
            return Err(CallError::Config("timeout_ms must be positive".to_owned()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| CallError::Config(format!("{name} is not a valid number: '{raw}'")))
        })
        .transpose()
}
