//! Observability infrastructure for tether.
//!
//! Structured logging with consistent spans: every engine operation runs
//! inside a span naming the operation and the entity it touches, so host
//! logs interleave cleanly with the embedding application's own output.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production hosts).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once when the engine is embedded. Safe to call multiple times;
/// subsequent calls are no-ops, so a host that already installed its own
/// subscriber keeps it.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tether_engine=debug`)
///
/// # Example
///
/// ```rust
/// use tether_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one pass through the command dispatch pipeline.
///
/// # Example
///
/// ```rust
/// use tether_core::observability::command_span;
///
/// let span = command_span("create_object", "01HX...");
/// let _guard = span.enter();
/// // ... dispatch the command
/// ```
#[must_use]
pub fn command_span(command: &str, command_id: &str) -> Span {
    tracing::info_span!("command", name = command, id = command_id)
}

/// Creates a span for one scheduler tick.
#[must_use]
pub fn scheduler_span(task_id: &str) -> Span {
    tracing::info_span!("tick", task_id = task_id)
}

/// Creates a span for a transaction execution.
#[must_use]
pub fn transaction_span(transaction_id: &str, name: &str) -> Span {
    tracing::info_span!("transaction", id = transaction_id, name = name)
}
