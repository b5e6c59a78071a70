//! Log initialization
//!
//! Structured logging through `tracing-subscriber`, JSON by default so the
//! container runtime's log collector can index the fields.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Output format for log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable
    Text,
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every line
    pub service_name: String,
    /// Output format
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "pgkeeper".to_string(),
            format: LogFormat::Json,
            default_filter: "info".to_string(),
        }
    }
}

/// Install the global subscriber
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };
    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}

/// In-memory capture of log events for assertions in tests
#[cfg(any(test, feature = "test-utils"))]
pub mod capture {
    use std::fmt::Write as _;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// A captured log event
    #[derive(Clone, Debug)]
    pub struct CapturedEvent {
        /// Level the event was emitted at
        pub level: Level,
        /// Message followed by `key=value` for every other field
        pub text: String,
    }

    /// Shared buffer of captured events
    #[derive(Clone, Default)]
    pub struct LogCapture {
        events: Arc<Mutex<Vec<CapturedEvent>>>,
    }

    impl LogCapture {
        /// Install as the thread-default subscriber until the guard drops
        ///
        /// Works with `#[tokio::test]` because the default runtime is
        /// single-threaded.
        pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
            let capture = Self::default();
            let subscriber = tracing_subscriber::registry().with(capture.clone());
            let guard = tracing::subscriber::set_default(subscriber);
            (capture, guard)
        }

        /// Every event at exactly `level`
        pub fn at(&self, level: Level) -> Vec<CapturedEvent> {
            self.events
                .lock()
                .iter()
                .filter(|e| e.level == level)
                .cloned()
                .collect()
        }

        /// Number of events at `level` whose text contains `needle`
        pub fn count(&self, level: Level, needle: &str) -> usize {
            self.at(level)
                .iter()
                .filter(|e| e.text.contains(needle))
                .count()
        }
    }

    struct TextVisitor<'a>(&'a mut String);

    impl Visit for TextVisitor<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                let _ = write!(self.0, "{value:?}");
            } else {
                let _ = write!(self.0, " {}={value:?}", field.name());
            }
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            if field.name() == "message" {
                self.0.push_str(value);
            } else {
                let _ = write!(self.0, " {}={value}", field.name());
            }
        }
    }

    impl<S: Subscriber> Layer<S> for LogCapture {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut text = String::new();
            event.record(&mut TextVisitor(&mut text));
            self.events.lock().push(CapturedEvent {
                level: *event.metadata().level(),
                text,
            });
        }
    }

}
