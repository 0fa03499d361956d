use crate::exchange::{Exchange, ExchangeError};
use serde::{Deserialize, Serialize};
use std::panic::Location;
use uuid::Uuid;

/// Installs `env_logger` as the `log` backend, filtering at `info` unless
/// `RUST_LOG` says otherwise. Returns `false` when a logger was already set.
pub fn init() -> bool {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogCode {
    ExchangeFailed,
    ExchangeRejected,
    ShutdownForced,
}

impl LogCode {
    pub fn of(error: &ExchangeError) -> Self {
        match error {
            ExchangeError::ThrottleRejected { .. }
            | ExchangeError::NoAvailableTarget { .. }
            | ExchangeError::Rejected { .. } => LogCode::ExchangeRejected,
            ExchangeError::ShutdownForced { .. } => LogCode::ShutdownForced,
            _ => LogCode::ExchangeFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    Route,
    Pipeline,
    IdempotentConsumer,
    Throttler,
    LoadBalancer,
    Context,
}

/// A structured log line describing an exchange.
#[derive(Debug, Serialize)]
pub struct LogEntry<'a> {
    timestamp: String,
    level: LogLevel,
    code: LogCode,
    thread_id: Option<&'a str>,
    file: Option<&'a str>,
    line: Option<u32>,
    column: Option<u32>,
    exchange_id: Uuid,
    route_id: Option<&'a str>,
    component: Component,
    message: &'a str,
    error: Option<String>,
}

impl<'a> LogEntry<'a> {
    pub fn new(
        log_level: LogLevel,
        code: LogCode,
        component: Component,
        exchange: &'a Exchange,
        message: &'a str,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: log_level,
            code,
            thread_id: None,
            file: None,
            line: None,
            column: None,
            exchange_id: *exchange.uuid(),
            route_id: exchange.route_id(),
            component,
            message,
            error: exchange.failure().map(|e| e.to_string()),
        }
    }

    pub fn with_thread(mut self, thread_id: Option<&'a str>) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_location(mut self, location: &'a Location<'a>) -> Self {
        self.file = Some(location.file());
        self.line = Some(location.line());
        self.column = Some(location.column());
        self
    }

    pub fn with_error(mut self, error: &ExchangeError) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn code(&self) -> LogCode {
        self.code
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or(String::from("Error serializing log entry"))
    }
}

/// Receives failures that no error handler dealt with.
pub trait ExceptionHandler: Send + Sync {
    fn handle(&self, message: &str, exchange: &Exchange, error: &ExchangeError);
}

/// Writes unhandled failures as JSON log entries at error level.
#[derive(Debug, Clone, Copy)]
pub struct LoggingExceptionHandler {
    component: Component,
}

impl LoggingExceptionHandler {
    pub fn new(component: Component) -> Self {
        Self { component }
    }
}

impl Default for LoggingExceptionHandler {
    fn default() -> Self {
        Self::new(Component::Route)
    }
}

impl ExceptionHandler for LoggingExceptionHandler {
    #[track_caller]
    fn handle(&self, message: &str, exchange: &Exchange, error: &ExchangeError) {
        let thread = std::thread::current();
        let entry = LogEntry::new(
            LogLevel::ERROR,
            LogCode::of(error),
            self.component,
            exchange,
            message,
        )
        .with_thread(thread.name())
        .with_location(Location::caller())
        .with_error(error);
        log::error!("{}", entry.to_json());
    }
}
