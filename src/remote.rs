//! OTLP/HTTP sink with bearer authentication and bounded retries.
//!
//! Encoding is done by `opentelemetry-otlp`. The HTTP client handed to it
//! ([`RetryingHttpClient`]) owns credentials, the POST itself, retry
//! classification, `Retry-After` handling and backoff. [`RemoteSink`] sits in
//! front of the OTLP exporter and turns any batch that still fails into a
//! diagnostics entry, so the batch processor and emitters never see it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use http::{Method, Request, Response};
use opentelemetry_http::{HttpClient, HttpError};
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::logs::{LogBatch, LogExporter};

use crate::config::RemoteConfig;
use crate::diagnostics::ExportDiagnostics;
use crate::errors::PipelineError;
use crate::retry::{RetryPolicy, Verdict, classify_status};

/// Shared stop signal for retry loops.
///
/// Once fired, backoff waits and in-flight attempts return immediately and no
/// further attempt starts.
#[derive(Debug, Default)]
pub struct Cancellation {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

impl Cancellation {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `delay` unless cancelled first. Returns true if cancelled.
    pub fn wait(&self, delay: Duration) -> bool {
        let guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = self
            .signal
            .wait_timeout_while(guard, delay, |_| !self.is_cancelled());
        self.is_cancelled()
    }

    /// Runs `f` on its own thread and waits for it unless cancelled first.
    ///
    /// Returns `Ok(None)` on cancellation. The abandoned call finishes in the
    /// background and its result is discarded.
    pub fn run_detached<T, F>(self: &Arc<Self>, name: &str, f: F) -> io::Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        {
            let slot = slot.clone();
            let cancellation = self.clone();
            thread::Builder::new().name(name.to_owned()).spawn(move || {
                let value = f();
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                let _guard = cancellation.lock.lock();
                cancellation.signal.notify_all();
            })?;
        }

        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                return Ok(Some(value));
            }
            if self.is_cancelled() {
                return Ok(None);
            }
            guard = self
                .signal
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// `HttpClient` for the OTLP exporter that authenticates and retries.
#[derive(Debug)]
pub struct RetryingHttpClient {
    client: reqwest::blocking::Client,
    authorization: HeaderValue,
    user_agent: HeaderValue,
    policy: RetryPolicy,
    diagnostics: Arc<ExportDiagnostics>,
    cancellation: Arc<Cancellation>,
}

impl RetryingHttpClient {
    pub fn new(
        config: &RemoteConfig,
        policy: RetryPolicy,
        diagnostics: Arc<ExportDiagnostics>,
        cancellation: Arc<Cancellation>,
    ) -> Result<Self, PipelineError> {
        let mut authorization =
            HeaderValue::from_str(&format!("Bearer {}", config.token.expose()))
                .map_err(|_| PipelineError::InvalidToken("token is not a valid header value"))?;
        authorization.set_sensitive(true);
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|_| PipelineError::InvalidUserAgent(config.user_agent.clone()))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            authorization,
            user_agent,
            policy,
            diagnostics,
            cancellation,
        })
    }
}

/// One POST, owning everything it needs so it can outlive the caller.
struct Attempt {
    client: reqwest::blocking::Client,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
}

impl Attempt {
    fn send(self) -> Result<Response<Bytes>, reqwest::Error> {
        let mut response = self
            .client
            .request(self.method, self.url)
            .headers(self.headers)
            .body(self.body.to_vec())
            .send()?;

        let status = response.status();
        let headers = std::mem::take(response.headers_mut());
        let body = response.bytes()?;
        let mut http_response = Response::new(body);
        *http_response.status_mut() = status;
        *http_response.headers_mut() = headers;
        Ok(http_response)
    }
}

#[async_trait]
impl HttpClient for RetryingHttpClient {
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        let (parts, body) = request.into_parts();
        let url = parts.uri.to_string();
        let mut headers = parts.headers;
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers.insert(USER_AGENT, self.user_agent.clone());
        let mut attempt = 0u32;

        loop {
            if self.cancellation.is_cancelled() {
                return Err("log export cancelled".into());
            }

            let request = Attempt {
                client: self.client.clone(),
                method: parts.method.clone(),
                url: url.clone(),
                headers: headers.clone(),
                body: body.clone(),
            };
            // the attempt itself is abandoned as soon as cancellation fires
            let outcome = self
                .cancellation
                .run_detached("dicelog-otlp-send", move || request.send())?;
            let Some(outcome) = outcome else {
                return Err("log export cancelled".into());
            };

            let verdict = match outcome {
                Ok(response) => {
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok());
                    let verdict = classify_status(response.status(), retry_after);
                    if !verdict.is_transient() || attempt >= self.policy.max_retries {
                        return Ok(response);
                    }
                    tracing::warn!(
                        target: "dicelog::remote",
                        status = response.status().as_u16(),
                        attempt = attempt + 1,
                        "transient status from collector, retrying"
                    );
                    verdict
                }
                Err(err) if err.is_builder() || attempt >= self.policy.max_retries => {
                    return Err(err.into());
                }
                Err(err) => {
                    tracing::warn!(
                        target: "dicelog::remote",
                        error = %err,
                        attempt = attempt + 1,
                        "request to collector failed, retrying"
                    );
                    Verdict::Retryable
                }
            };

            attempt += 1;
            self.diagnostics.record_retry();
            let delay = self.policy.delay_for(attempt, verdict);
            if self.cancellation.wait(delay) {
                return Err("log export cancelled".into());
            }
        }
    }
}

/// The remote half of the pipeline: OTLP/HTTP protobuf to `{endpoint}{path}`.
#[derive(Debug)]
pub struct RemoteSink {
    exporter: opentelemetry_otlp::LogExporter,
    diagnostics: Arc<ExportDiagnostics>,
}

impl RemoteSink {
    /// Builds the exporter. No connection is made until the first batch.
    pub fn build(
        config: &RemoteConfig,
        policy: RetryPolicy,
        diagnostics: Arc<ExportDiagnostics>,
        cancellation: Arc<Cancellation>,
    ) -> Result<Self, PipelineError> {
        let url = config.collector_url()?;
        let client = RetryingHttpClient::new(config, policy, diagnostics.clone(), cancellation)?;
        let exporter = opentelemetry_otlp::LogExporter::builder()
            .with_http()
            .with_http_client(client)
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(url.as_str())
            .with_timeout(config.timeout)
            .build()?;

        Ok(Self {
            exporter,
            diagnostics,
        })
    }
}

impl LogExporter for RemoteSink {
    async fn export(&self, batch: LogBatch<'_>) -> OTelSdkResult {
        let records = batch.iter().count();
        match self.exporter.export(batch).await {
            Ok(()) => self.diagnostics.record_export(records),
            Err(err) => self.diagnostics.record_drop(records, &err.to_string()),
        }
        Ok(())
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.exporter.set_resource(resource);
    }
}
