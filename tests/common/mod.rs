#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use dicelog::{BatchSettings, PipelineConfig, RetryPolicy};
use opentelemetry::logs::{AnyValue, LogRecord, Logger, Severity};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::logs::{LogBatch, LogExporter, SdkLogger};
use prost::Message;
use tokio::sync::oneshot;

/// One record as seen by a [`RecordingExporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sink: &'static str,
    pub scope: String,
    pub body: String,
}

/// Fake sink appending every record it exports to a journal it may share with other sinks.
#[derive(Debug, Clone)]
pub struct RecordingExporter {
    label: &'static str,
    journal: Arc<Mutex<Vec<Delivery>>>,
}

impl RecordingExporter {
    pub fn new(label: &'static str, journal: Arc<Mutex<Vec<Delivery>>>) -> Self {
        Self { label, journal }
    }
}

impl LogExporter for RecordingExporter {
    async fn export(&self, batch: LogBatch<'_>) -> OTelSdkResult {
        let mut journal = self.journal.lock().unwrap();
        for (record, scope) in batch.iter() {
            journal.push(Delivery {
                sink: self.label,
                scope: scope.name().to_owned(),
                body: record
                    .body()
                    .map(dicelog::local::render_value)
                    .unwrap_or_default(),
            });
        }
        Ok(())
    }
}

pub fn deliveries_to(journal: &Arc<Mutex<Vec<Delivery>>>, sink: &str) -> Vec<Delivery> {
    journal
        .lock()
        .unwrap()
        .iter()
        .filter(|d| d.sink == sink)
        .cloned()
        .collect()
}

/// What the mock collector answers with.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Status(u16),
    RetryAfter(u16, &'static str),
    /// Never answers.
    Hang,
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub authorization: Option<String>,
    pub user_agent: Option<String>,
    pub content_type: Option<String>,
    pub records: usize,
}

struct CollectorState {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    requests: Mutex<Vec<CapturedRequest>>,
}

/// OTLP/HTTP logs endpoint on its own runtime thread.
///
/// Replies are taken from the script in order, then `fallback` forever.
pub struct MockCollector {
    addr: SocketAddr,
    state: Arc<CollectorState>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MockCollector {
    pub fn start(script: impl IntoIterator<Item = Reply>, fallback: Reply) -> Self {
        let state = Arc::new(CollectorState {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            requests: Mutex::new(Vec::new()),
        });

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route("/v1/logs", post(ingest))
            .with_state(state.clone());
        let (stop, stopped) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("mock-collector".to_owned())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                runtime.block_on(async move {
                    let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                    tokio::spawn(axum::serve(listener, app).into_future());
                    let _ = stopped.await;
                });
                // dropping the runtime aborts hung handlers
            })
            .unwrap();

        Self {
            addr,
            state,
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    pub fn healthy() -> Self {
        Self::start([], Reply::Status(200))
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn records_received(&self) -> usize {
        self.requests().iter().map(|r| r.records).sum::<usize>()
    }
}

impl Drop for MockCollector {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn ingest(
    State(state): State<Arc<CollectorState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    let records = ExportLogsServiceRequest::decode(body.as_ref())
        .map(|request| {
            request
                .resource_logs
                .iter()
                .flat_map(|r| r.scope_logs.iter())
                .map(|s| s.log_records.len())
                .sum::<usize>()
        })
        .unwrap_or_default();
    state.requests.lock().unwrap().push(CapturedRequest {
        authorization: header_value(header::AUTHORIZATION),
        user_agent: header_value(header::USER_AGENT),
        content_type: header_value(header::CONTENT_TYPE),
        records,
    });

    let reply = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(state.fallback);
    match reply {
        Reply::Status(code) => status(code).into_response(),
        Reply::RetryAfter(code, after) => {
            (status(code), [(header::RETRY_AFTER, after)]).into_response()
        }
        Reply::Hang => std::future::pending::<Response>().await,
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap()
}

pub const TOKEN: &str = "test-shipping-token";

/// Pipeline config aimed at `endpoint` with quick retries and no global side effects.
///
/// The scheduled delay is long so that only flushes and full batches trigger exports.
pub fn collector_config(endpoint: &str) -> PipelineConfig {
    PipelineConfig::new(endpoint, TOKEN)
        .with_install_global(false)
        .with_install_subscriber(false)
        .with_request_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            max_retry_after: Duration::from_secs(1),
        })
        .with_batch(BatchSettings {
            scheduled_delay: Duration::from_secs(60),
            ..BatchSettings::default()
        })
}

pub fn emit_info(logger: &SdkLogger, body: impl Into<String>) {
    let mut record = logger.create_log_record();
    record.set_severity_number(Severity::Info);
    record.set_body(AnyValue::from(body.into()));
    logger.emit(record);
}

/// Polls `condition` until it holds or `timeout` runs out.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
