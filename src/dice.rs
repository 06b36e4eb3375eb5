//! Example traffic: a dice-rolling HTTP handler that logs every roll.
//!
//! `GET /rolldice[/<player>]` answers with the roll (`1`-`6`) and a newline
//! and emits one informational record per request.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use opentelemetry::logs::{AnyValue, LogRecord, Logger, Severity};
use opentelemetry_sdk::logs::SdkLogger;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Scope attached to every record the handler emits.
pub const SCOPE_NAME: &str = "dicelog.example.dice";
pub const ANONYMOUS: &str = "Anonymous";

/// Source of uniform integers in `[0, n)`.
pub trait Roller: Send + Sync {
    fn intn(&self, n: u32) -> u32;
}

/// Thread-local RNG, the production roller.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRoller;

impl Roller for ThreadRoller {
    fn intn(&self, n: u32) -> u32 {
        rand::rng().random_range(0..n)
    }
}

/// Deterministic roller for reproducible runs.
#[derive(Debug)]
pub struct SeededRoller(Mutex<StdRng>);

impl SeededRoller {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl Roller for SeededRoller {
    fn intn(&self, n: u32) -> u32 {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(0..n)
    }
}

#[derive(Clone)]
pub struct DiceState {
    logger: Arc<SdkLogger>,
    roller: Arc<dyn Roller>,
}

impl DiceState {
    pub fn new(logger: SdkLogger, roller: Arc<dyn Roller>) -> Self {
        Self {
            logger: Arc::new(logger),
            roller,
        }
    }

    /// Uses the process-wide default provider instead of an explicit logger.
    pub fn from_global(roller: Arc<dyn Roller>) -> Self {
        Self::new(crate::global::logger(SCOPE_NAME), roller)
    }

    /// Rolls for `player`, logs the outcome and writes `"<roll>\n"` to `out`.
    ///
    /// A failed write is logged at error severity and handed back.
    pub fn roll<W: Write>(&self, player: &str, out: &mut W) -> io::Result<u32> {
        let roll = 1 + self.roller.intn(6);

        let body = if player == ANONYMOUS {
            format!("{ANONYMOUS} player is rolling the dice")
        } else {
            format!("{player} is rolling the dice")
        };
        self.emit(Severity::Info, body, "result", AnyValue::Int(i64::from(roll)));

        if let Err(err) = out.write_all(format!("{roll}\n").as_bytes()) {
            self.emit(
                Severity::Error,
                "Write failed".to_owned(),
                "error",
                AnyValue::from(err.to_string()),
            );
            return Err(err);
        }
        Ok(roll)
    }

    fn emit(&self, severity: Severity, body: String, key: &'static str, value: AnyValue) {
        let mut record = self.logger.create_log_record();
        record.set_timestamp(SystemTime::now());
        record.set_severity_number(severity);
        record.set_severity_text(severity.name());
        record.set_body(AnyValue::from(body));
        record.add_attribute(key, value);
        self.logger.emit(record);
    }
}

/// Player named by the third `/`-separated path segment, else `Anonymous`.
pub fn player_name(path: &str) -> &str {
    match path.split('/').nth(2) {
        Some(segment) if !segment.is_empty() => segment,
        _ => ANONYMOUS,
    }
}

pub fn router(state: DiceState) -> Router {
    Router::new()
        .route("/rolldice", get(rolldice))
        .route("/rolldice/", get(rolldice))
        .route("/rolldice/{player}", get(rolldice))
        .with_state(state)
}

async fn rolldice(State(state): State<DiceState>, uri: Uri) -> Response {
    let player = player_name(uri.path());
    let mut body = Vec::with_capacity(2);
    let written = state.roll(player, &mut body);
    respond(written, body)
}

// The roll is buffered before axum sends it, so only a failed buffer write lands
// on the 500 branch. A peer hanging up mid-response is the server's concern.
fn respond(written: io::Result<u32>, body: Vec<u8>) -> Response {
    match written {
        Ok(_) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
