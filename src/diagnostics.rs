//! Internal error channel for the export path.
//!
//! Export failures never reach emitters. They are counted here and reported
//! as `tracing` events under the `dicelog::diagnostics` target.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ExportDiagnostics {
    batches_exported: AtomicU64,
    records_exported: AtomicU64,
    batches_dropped: AtomicU64,
    records_dropped: AtomicU64,
    retries: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time copy of [`ExportDiagnostics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub batches_exported: u64,
    pub records_exported: u64,
    pub batches_dropped: u64,
    pub records_dropped: u64,
    pub retries: u64,
    pub last_error: Option<String>,
}

impl ExportDiagnostics {
    pub(crate) fn record_export(&self, records: usize) {
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
        self.records_exported
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self, records: usize, error: &str) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.records_dropped
            .fetch_add(records as u64, Ordering::Relaxed);
        tracing::error!(
            target: "dicelog::diagnostics",
            records,
            error,
            "remote log batch dropped"
        );
        let mut last = match self.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(error.to_owned());
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let last_error = match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        DiagnosticsSnapshot {
            batches_exported: self.batches_exported.load(Ordering::Relaxed),
            records_exported: self.records_exported.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            last_error,
        }
    }
}
