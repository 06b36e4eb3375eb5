use std::fmt;
use std::time::Duration;

use opentelemetry_sdk::logs::{BatchConfig, BatchConfigBuilder};
use url::Url;

use crate::errors::PipelineError;
use crate::retry::RetryPolicy;

pub const DEFAULT_URL_PATH: &str = "/v1/logs";
pub const DEFAULT_USER_AGENT: &str = concat!("dicelog-rust-logs-otlp/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_SERVICE_NAME: &str = "roll-dice";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DIAGNOSTICS_FILTER: &str = "info,opentelemetry=warn";

/// Static bearer credential for the remote collector.
///
/// The value is only ever turned into a sensitive header; `Debug` never shows it.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }

    fn validate(&self) -> Result<(), PipelineError> {
        let token = self.0.trim();
        if token.is_empty() {
            return Err(PipelineError::InvalidToken("token is empty"));
        }
        if token.contains('<') || token.contains('>') {
            return Err(PipelineError::InvalidToken("token is a placeholder"));
        }
        if token.chars().any(|c| c.is_ascii_control() || c.is_whitespace()) {
            return Err(PipelineError::InvalidToken(
                "token contains whitespace or control characters",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

impl From<String> for BearerToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for BearerToken {
    fn from(token: &str) -> Self {
        Self(token.to_owned())
    }
}

/// Where and how the RemoteSink ships batches.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// `host[:port]` (https implied) or a full `http(s)://` base URL.
    pub endpoint: String,
    pub url_path: String,
    pub token: BearerToken,
    pub user_agent: String,
    /// Per-request timeout of the HTTP client.
    pub timeout: Duration,
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>, token: impl Into<BearerToken>) -> Self {
        Self {
            endpoint: endpoint.into(),
            url_path: DEFAULT_URL_PATH.to_owned(),
            token: token.into(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Resolves `{endpoint}{url_path}` into the collector URL.
    pub fn collector_url(&self) -> Result<Url, PipelineError> {
        let raw = self.endpoint.trim();
        let invalid = |reason: &str| PipelineError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason: reason.to_owned(),
        };

        if raw.is_empty() {
            return Err(invalid("endpoint is empty"));
        }
        if is_placeholder(raw) {
            return Err(invalid("endpoint is a placeholder"));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_owned()
        } else {
            format!("https://{raw}")
        };
        let mut url = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("endpoint has no host"));
        }

        let path = if self.url_path.starts_with('/') {
            self.url_path.clone()
        } else {
            format!("/{}", self.url_path)
        };
        let base = url.path().trim_end_matches('/').to_owned();
        if !base.ends_with(&path) {
            url.set_path(&format!("{base}{path}"));
        }
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        self.collector_url()?;
        self.token.validate()?;
        if self.user_agent.trim().is_empty()
            || http::HeaderValue::from_str(&self.user_agent).is_err()
        {
            return Err(PipelineError::InvalidUserAgent(self.user_agent.clone()));
        }
        Ok(())
    }
}

// `<LOGZIO_OTLP_LISTENER>` style or a bare `LOGZIO_OTLP_LISTENER`
fn is_placeholder(endpoint: &str) -> bool {
    if endpoint.contains('<') || endpoint.contains('>') {
        return true;
    }
    let host = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest)
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    host.contains('_')
        && host
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Queueing and batching knobs applied to both batch processors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSettings {
    /// Records beyond this many pending are dropped (newest first).
    pub max_queue_size: usize,
    pub max_export_batch_size: usize,
    /// Longest a record waits before a timer-triggered export.
    pub scheduled_delay: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 16_384,
            max_export_batch_size: 512,
            scheduled_delay: Duration::from_secs(1),
        }
    }
}

impl BatchSettings {
    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        if self.max_queue_size == 0 || self.max_export_batch_size == 0 {
            return Err(PipelineError::InvalidBatchSettings(
                "queue and batch sizes must be positive".to_owned(),
            ));
        }
        if self.max_export_batch_size > self.max_queue_size {
            return Err(PipelineError::InvalidBatchSettings(format!(
                "max_export_batch_size ({}) exceeds max_queue_size ({})",
                self.max_export_batch_size, self.max_queue_size
            )));
        }
        if self.scheduled_delay.is_zero() {
            return Err(PipelineError::InvalidBatchSettings(
                "scheduled_delay must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }

    pub(crate) fn to_batch_config(self) -> BatchConfig {
        BatchConfigBuilder::default()
            .with_max_queue_size(self.max_queue_size)
            .with_max_export_batch_size(self.max_export_batch_size)
            .with_scheduled_delay(self.scheduled_delay)
            .build()
    }
}

/// Everything Bootstrap needs. Set once, never reloaded.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// `service.name` resource attribute on every record.
    pub service_name: String,
    pub remote: RemoteConfig,
    pub batch: BatchSettings,
    pub retry: RetryPolicy,
    /// Register the provider as the process-wide default (see [`crate::global`]).
    pub install_global: bool,
    /// Install the `tracing` bridge and stderr diagnostics subscriber.
    pub install_subscriber: bool,
    /// `EnvFilter` directives for the stderr diagnostics layer.
    pub diagnostics_filter: String,
}

impl PipelineConfig {
    pub fn new(endpoint: impl Into<String>, token: impl Into<BearerToken>) -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            remote: RemoteConfig::new(endpoint, token),
            batch: BatchSettings::default(),
            retry: RetryPolicy::default(),
            install_global: true,
            install_subscriber: true,
            diagnostics_filter: DEFAULT_DIAGNOSTICS_FILTER.to_owned(),
        }
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn with_url_path(mut self, url_path: impl Into<String>) -> Self {
        self.remote.url_path = url_path.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.remote.user_agent = user_agent.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.remote.timeout = timeout;
        self
    }

    pub fn with_batch(mut self, batch: BatchSettings) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_install_global(mut self, install: bool) -> Self {
        self.install_global = install;
        self
    }

    pub fn with_install_subscriber(mut self, install: bool) -> Self {
        self.install_subscriber = install;
        self
    }

    pub fn with_diagnostics_filter(mut self, filter: impl Into<String>) -> Self {
        self.diagnostics_filter = filter.into();
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.remote.validate()?;
        self.batch.validate()
    }
}
