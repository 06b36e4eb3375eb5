use std::time::Duration;

use opentelemetry_sdk::error::OTelSdkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid OTLP endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid bearer token: {0}")]
    InvalidToken(&'static str),

    #[error("Invalid user agent `{0}`")]
    InvalidUserAgent(String),

    #[error("Invalid batch settings: {0}")]
    InvalidBatchSettings(String),

    #[error("Failed to build OTLP log exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Invalid diagnostics filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Logger provider {operation} failed: {source}")]
    Provider {
        operation: &'static str,
        #[source]
        source: OTelSdkError,
    },

    #[error("Logger provider {operation} exceeded its deadline of {deadline:?}")]
    DeadlineExceeded {
        operation: &'static str,
        deadline: Duration,
    },

    #[error("Log pipeline is closed")]
    Closed,

    #[error("Logger provider {0} worker panicked")]
    WorkerPanicked(&'static str),

    #[error("Failed to spawn {operation} worker: {source}")]
    Spawn {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// True when a flush or shutdown ran out of time.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, PipelineError::DeadlineExceeded { .. })
    }
}
