/*!
This crate wires a structured-logging pipeline that ships every record to two places at once:
a human-readable sink on standard output and an OTLP/HTTP collector.

[`setup`] builds both exporters, puts each behind its own batch processor, registers them on one
logger provider (local first, remote second) and installs that provider as the process-wide
default. The returned [`LogPipeline`] hands out loggers and is the one place to flush and shut
the whole thing down.

```no_run
use std::time::Duration;
use dicelog::{PipelineConfig, dice};
use opentelemetry::logs::{LogRecord, Logger, Severity};

let pipeline = dicelog::setup(PipelineConfig::new("otlp-listener.logz.io", "my-shipping-token"))?;
let logger = pipeline.logger(dice::SCOPE_NAME);
let mut record = logger.create_log_record();
record.set_severity_number(Severity::Info);
record.set_body("hello".into());
logger.emit(record);
pipeline.shutdown(Duration::from_secs(5))?;
# Ok::<(), dicelog::PipelineError>(())
```
*/
use opentelemetry::logs::LoggerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::logs::{BatchLogProcessor, LogExporter, SdkLogger, SdkLoggerProvider};
use std::borrow::Cow;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub mod config;
pub mod dice;
pub mod diagnostics;
mod errors;
pub mod global;
pub mod local;
pub mod remote;
pub mod retry;

pub use config::{BatchSettings, BearerToken, PipelineConfig, RemoteConfig};
pub use diagnostics::{DiagnosticsSnapshot, ExportDiagnostics};
pub use errors::PipelineError;
pub use local::LocalSink;
pub use remote::{Cancellation, RemoteSink};
pub use retry::RetryPolicy;

/// Deadline used by [`LogPipeline::async_shutdown`] when none is given.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle of a [`LogPipeline`]. Only `Running` accepts flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Draining,
    Closed,
}

///Handle on the whole logging apparatus, and the one place to shut it down
#[derive(Debug, Clone)]
pub struct LogPipeline {
    provider: SdkLoggerProvider,
    diagnostics: Arc<ExportDiagnostics>,
    cancellation: Arc<Cancellation>,
    state: Arc<AtomicU8>,
    flush_worker: Arc<FlushWorker>,
}

impl LogPipeline {
    /// Composes a pipeline from any two exporters, each behind its own batch processor.
    ///
    /// `local` is registered first so every record is observed locally before it is shipped.
    pub fn from_exporters<L, R>(local: L, remote: R, config: &PipelineConfig) -> Self
    where
        L: LogExporter + 'static,
        R: LogExporter + 'static,
    {
        Self::assemble(
            local,
            remote,
            config,
            Arc::new(ExportDiagnostics::default()),
            Arc::new(Cancellation::default()),
        )
    }

    fn assemble<L, R>(
        local: L,
        remote: R,
        config: &PipelineConfig,
        diagnostics: Arc<ExportDiagnostics>,
        cancellation: Arc<Cancellation>,
    ) -> Self
    where
        L: LogExporter + 'static,
        R: LogExporter + 'static,
    {
        let local_processor = BatchLogProcessor::builder(local)
            .with_batch_config(config.batch.to_batch_config())
            .build();
        let remote_processor = BatchLogProcessor::builder(remote)
            .with_batch_config(config.batch.to_batch_config())
            .build();

        let provider = SdkLoggerProvider::builder()
            .with_resource(
                Resource::builder()
                    .with_service_name(config.service_name.clone())
                    .build(),
            )
            .with_log_processor(local_processor)
            .with_log_processor(remote_processor)
            .build();

        Self {
            provider,
            diagnostics,
            cancellation,
            state: Arc::new(AtomicU8::new(RUNNING)),
            flush_worker: Arc::new(FlushWorker::default()),
        }
    }

    /// Logger tagged with `scope`. Cheap; keep it as long as you like.
    pub fn logger(&self, scope: impl Into<Cow<'static, str>>) -> SdkLogger {
        self.provider.logger(scope)
    }

    pub fn provider(&self) -> &SdkLoggerProvider {
        &self.provider
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn state(&self) -> PipelineState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => PipelineState::Running,
            DRAINING => PipelineState::Draining,
            _ => PipelineState::Closed,
        }
    }

    /// Makes this pipeline's provider the process-wide default.
    pub fn install_global(&self) {
        if global::set_logger_provider(self.provider.clone()).is_some() {
            tracing::warn!(
                target: "dicelog::pipeline",
                "replaced a previously installed global logger provider"
            );
        }
    }

    /// Exports everything emitted so far, waiting at most `deadline`.
    ///
    /// Flushes run one at a time on a single worker thread per pipeline.
    pub fn force_flush(&self, deadline: Duration) -> Result<(), PipelineError> {
        if self.state() != PipelineState::Running {
            return Err(PipelineError::Closed);
        }
        let provider = self.provider.clone();
        run_with_deadline(
            "force_flush",
            deadline,
            move || provider.force_flush(),
            |job| self.flush_worker.submit(job),
        )
    }

    ///Blocking function to drain both processors and close the exporters
    ///
    /// Emissions after this point are dropped. If `deadline` runs out first, pending records are
    /// abandoned, in-flight retries are cancelled and [`PipelineError::DeadlineExceeded`] is
    /// returned. Failures are logged before being returned.
    pub fn shutdown(&self, deadline: Duration) -> Result<(), PipelineError> {
        if self
            .state
            .compare_exchange(RUNNING, DRAINING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::Closed);
        }

        let provider = self.provider.clone();
        // its own thread, so a flush stuck on the worker cannot hold the shutdown back
        let result = run_with_deadline(
            "shutdown",
            deadline,
            move || provider.shutdown_with_timeout(deadline),
            |job| spawn_detached("shutdown", job),
        );
        self.state.store(CLOSED, Ordering::SeqCst);

        if let Err(err) = &result {
            if err.is_deadline_exceeded() {
                self.cancellation.cancel();
            }
            tracing::error!(
                target: "dicelog::pipeline",
                error = %err,
                "Error during logger provider shutdown"
            );
        }
        result
    }

    /// Detached [`LogPipeline::shutdown`] for hosts that only keep the teardown around.
    pub fn shutdown_hook(&self) -> impl FnOnce(Duration) -> Result<(), PipelineError> + Send + 'static {
        let pipeline = self.clone();
        move |deadline| pipeline.shutdown(deadline)
    }

    ///Async function to shutdown the pipeline gracefully with timeout support
    ///
    /// This is useful when shutting down in async contexts (e.g., tokio runtime)
    /// where the blocking [`LogPipeline::shutdown`] must not run on a worker thread.
    ///
    /// # Arguments
    /// * `timeout` - Maximum duration to wait for shutdown. If None, [`DEFAULT_SHUTDOWN_TIMEOUT`].
    pub async fn async_shutdown(&self, timeout: Option<Duration>) -> Result<(), PipelineError> {
        let deadline = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        let pipeline = self.clone();
        let shutdown_future = tokio::task::spawn_blocking(move || pipeline.shutdown(deadline));

        tokio::time::timeout(deadline, shutdown_future)
            .await
            .map_err(|_| PipelineError::DeadlineExceeded {
                operation: "shutdown",
                deadline,
            })??
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Long-lived thread running flush requests one after another.
///
/// A flush stuck behind a hung exporter holds up later flushes, which then miss their own
/// deadlines, rather than leaving one blocked thread behind per call.
#[derive(Debug, Default)]
struct FlushWorker {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl FlushWorker {
    fn submit(&self, job: Job) -> Result<(), PipelineError> {
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let job = match sender.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => return Ok(()),
                // the previous worker died with a panicking job
                Err(mpsc::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("dicelog-flush".to_owned())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .map_err(|source| PipelineError::Spawn {
                operation: "force_flush",
                source,
            })?;
        // the receiver is alive until the worker sees this job
        let _ = tx.send(job);
        *sender = Some(tx);
        Ok(())
    }
}

fn spawn_detached(operation: &'static str, job: Job) -> Result<(), PipelineError> {
    thread::Builder::new()
        .name(format!("dicelog-{operation}"))
        .spawn(job)
        .map(drop)
        .map_err(|source| PipelineError::Spawn { operation, source })
}

fn run_with_deadline<F, S>(
    operation: &'static str,
    deadline: Duration,
    f: F,
    spawn: S,
) -> Result<(), PipelineError>
where
    F: FnOnce() -> OTelSdkResult + Send + 'static,
    S: FnOnce(Job) -> Result<(), PipelineError>,
{
    let started = Instant::now();
    let (tx, rx) = mpsc::sync_channel(1);
    spawn(Box::new(move || {
        let _ = tx.send(f());
    }))?;

    let deadline_exceeded = PipelineError::DeadlineExceeded {
        operation,
        deadline,
    };
    match rx.recv_timeout(deadline) {
        Ok(Ok(())) => Ok(()),
        // processors report their own timeouts, possibly folded into an aggregate error
        Ok(Err(OTelSdkError::Timeout(_))) => Err(deadline_exceeded),
        Ok(Err(_)) if started.elapsed() >= deadline => Err(deadline_exceeded),
        Ok(Err(source)) => Err(PipelineError::Provider { operation, source }),
        Err(RecvTimeoutError::Timeout) => Err(deadline_exceeded),
        Err(RecvTimeoutError::Disconnected) => Err(PipelineError::WorkerPanicked(operation)),
    }
}

///library entrypoint
///
///Builds the local (stdout) sink, then the remote OTLP/HTTP sink, batches both behind one
///provider and installs it as configured.
pub fn setup(config: PipelineConfig) -> Result<LogPipeline, PipelineError> {
    setup_with_writer(config, std::io::stdout())
}

/// [`setup`] with the local sink writing to `writer` instead of stdout.
pub fn setup_with_writer<W>(config: PipelineConfig, writer: W) -> Result<LogPipeline, PipelineError>
where
    W: Write + Send + 'static,
{
    config.validate()?;

    let local = LocalSink::new(writer);
    let diagnostics = Arc::new(ExportDiagnostics::default());
    let cancellation = Arc::new(Cancellation::default());
    // dropping `local` on failure flushes and releases it
    let remote = RemoteSink::build(
        &config.remote,
        config.retry.clone(),
        diagnostics.clone(),
        cancellation.clone(),
    )?;

    let pipeline = LogPipeline::assemble(local, remote, &config, diagnostics, cancellation);

    if config.install_subscriber {
        if let Err(err) = init_subscriber(&pipeline.provider, &config.diagnostics_filter) {
            let _ = pipeline.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
            return Err(err);
        }
    }
    if config.install_global {
        pipeline.install_global();
    }

    tracing::info!(
        target: "dicelog::pipeline",
        service = %config.service_name,
        endpoint = %config.remote.endpoint,
        "log pipeline started"
    );
    Ok(pipeline)
}

fn init_subscriber(provider: &SdkLoggerProvider, diagnostics_filter: &str) -> Result<(), PipelineError> {
    let otel_layer = OpenTelemetryTracingBridge::new(provider);

    // Anything the export path itself logs must stay out of the pipeline, otherwise a failing
    // export would feed new records into the same failing export. The HTTP stack and the
    // OpenTelemetry crates are switched off for the bridge, as is this crate's own diagnostics.
    let filter_otel = EnvFilter::try_new(
        "info,hyper=off,h2=off,reqwest=off,opentelemetry=off,opentelemetry_sdk=off,opentelemetry_otlp=off,dicelog=off",
    )?;
    let otel_layer = otel_layer.with_filter(filter_otel);

    // Diagnostics go to stderr so stdout stays reserved for the local sink.
    let filter_fmt = EnvFilter::try_new(diagnostics_filter)?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_filter(filter_fmt);

    if tracing_subscriber::registry()
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!(
            target: "dicelog::pipeline",
            "a global tracing subscriber is already installed, keeping it"
        );
    }
    Ok(())
}
