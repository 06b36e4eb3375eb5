//! Process-wide default logger provider.
//!
//! Prefer passing a [`LogPipeline`](crate::LogPipeline) or an `SdkLogger`
//! through constructors. This exists for call sites that cannot be reached
//! that way. Until a provider is installed, loggers obtained here are no-ops.

use std::borrow::Cow;
use std::sync::{OnceLock, PoisonError, RwLock};

use opentelemetry::logs::LoggerProvider as _;
use opentelemetry_sdk::logs::{SdkLogger, SdkLoggerProvider};

static GLOBAL_LOGGER_PROVIDER: RwLock<Option<SdkLoggerProvider>> = RwLock::new(None);

// A provider without processors drops everything it is given.
fn noop_provider() -> &'static SdkLoggerProvider {
    static NOOP: OnceLock<SdkLoggerProvider> = OnceLock::new();
    NOOP.get_or_init(|| SdkLoggerProvider::builder().build())
}

/// Installs `provider` as the default, returning the one it replaces.
pub fn set_logger_provider(provider: SdkLoggerProvider) -> Option<SdkLoggerProvider> {
    GLOBAL_LOGGER_PROVIDER
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(provider)
}

/// The installed default, or a no-op provider when nothing is installed.
pub fn logger_provider() -> SdkLoggerProvider {
    GLOBAL_LOGGER_PROVIDER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_else(|| noop_provider().clone())
}

/// Logger for `scope` from the default provider.
pub fn logger(scope: impl Into<Cow<'static, str>>) -> SdkLogger {
    logger_provider().logger(scope)
}
