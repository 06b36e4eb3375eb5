//! Human-readable sink that renders log batches as indented text.
//!
//! The layout follows the stdout exporter shipped with OpenTelemetry: one
//! `Resource` header the first time anything is written, then one indented
//! block per record. It is meant for eyes, not for parsers.

use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use opentelemetry::logs::AnyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::logs::{LogBatch, LogExporter, SdkLogRecord};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub struct LocalSink {
    writer: Mutex<Box<dyn Write + Send>>,
    resource: Resource,
    resource_emitted: AtomicBool,
    sequence: AtomicU64,
}

impl LocalSink {
    /// Sink writing to the process's standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
            resource: Resource::builder_empty().build(),
            resource_emitted: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        }
    }

    fn render(&self, batch: &LogBatch<'_>) -> Result<String, fmt::Error> {
        let mut out = String::new();
        if !self.resource_emitted.swap(true, Ordering::SeqCst) {
            writeln!(out, "Resource")?;
            for (key, value) in self.resource.iter() {
                writeln!(out, "\t ->  {key}={value}")?;
            }
        }
        for (record, scope) in batch.iter() {
            let n = self.sequence.fetch_add(1, Ordering::Relaxed);
            writeln!(out, "Log #{n}")?;
            match scope.version() {
                Some(version) => {
                    writeln!(out, "\t Instrumentation Scope: {} ({version})", scope.name())?
                }
                None => writeln!(out, "\t Instrumentation Scope: {}", scope.name())?,
            }
            render_record(&mut out, record)?;
        }
        Ok(out)
    }
}

fn render_record(out: &mut String, record: &SdkLogRecord) -> fmt::Result {
    if let Some(event_name) = record.event_name() {
        writeln!(out, "\t EventName: {event_name}")?;
    }
    if let Some(timestamp) = record.timestamp() {
        let datetime: DateTime<Utc> = timestamp.into();
        writeln!(out, "\t Timestamp: {}", datetime.format(TIMESTAMP_FORMAT))?;
    }
    if let Some(timestamp) = record.observed_timestamp() {
        let datetime: DateTime<Utc> = timestamp.into();
        writeln!(
            out,
            "\t Observed Timestamp: {}",
            datetime.format(TIMESTAMP_FORMAT)
        )?;
    }
    if let Some(severity) = record.severity_text() {
        writeln!(out, "\t SeverityText: {severity}")?;
    }
    if let Some(severity) = record.severity_number() {
        writeln!(out, "\t SeverityNumber: {severity:?}")?;
    }
    if let Some(body) = record.body() {
        writeln!(out, "\t Body: {}", render_value(body))?;
    }
    writeln!(out, "\t Attributes:")?;
    for (key, value) in record.attributes_iter() {
        writeln!(out, "\t\t ->  {key}: {}", render_value(value))?;
    }
    Ok(())
}

/// Renders a log value the way a person would write it down.
pub fn render_value(value: &AnyValue) -> String {
    match value {
        AnyValue::Int(i) => i.to_string(),
        AnyValue::Double(d) => d.to_string(),
        AnyValue::String(s) => s.as_str().to_owned(),
        AnyValue::Boolean(b) => b.to_string(),
        AnyValue::Bytes(bytes) => format!("{bytes:02x?}"),
        AnyValue::ListAny(items) => {
            let items: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", items.join(", "))
        }
        AnyValue::Map(map) => {
            let mut entries: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k.as_str(), render_value(v)))
                .collect();
            entries.sort();
            format!("{{{}}}", entries.join(", "))
        }
        other => format!("{other:?}"),
    }
}

impl fmt::Debug for LocalSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSink")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl LogExporter for LocalSink {
    async fn export(&self, batch: LogBatch<'_>) -> OTelSdkResult {
        let rendered = self
            .render(&batch)
            .map_err(|e| OTelSdkError::InternalFailure(format!("failed to render logs: {e}")))?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| OTelSdkError::InternalFailure(e.to_string()))?;
        writer
            .write_all(rendered.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|e| OTelSdkError::InternalFailure(format!("failed to write logs: {e}")))
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.resource = resource.clone();
    }
}

impl Drop for LocalSink {
    fn drop(&mut self) {
        if let Ok(writer) = self.writer.get_mut() {
            let _ = writer.flush();
        }
    }
}
