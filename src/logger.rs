/*!
 * Logging for DbKeeper
 * Structured tracing output with compact and detailed line formats
 */

use std::fmt;
use chrono::{DateTime, Utc};
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO "),
            LogLevel::Warning => write!(f, "WARN "),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE | Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warning,
            Level::ERROR => LogLevel::Error,
        }
    }
}

impl LogLevel {
    /// Parses `debug`, `info`, `warn`/`warning` and `error`; anything else is `Info`.
    pub fn parse(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "trace" | "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    fn filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            LogLevel::Debug => "•",
            LogLevel::Info => "✓",
            LogLevel::Warning => "⚠",
            LogLevel::Error => "✗",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub pid: u32,
    pub message: String,
    pub fields: Vec<(String, String)>,
    pub target: String,
    pub line: Option<u32>,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            pid: std::process::id(),
            message,
            fields: Vec::new(),
            target: "dbkeeper".to_string(),
            line: None,
        }
    }

    fn rendered_fields(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!(" {}={}", k, v))
            .collect()
    }

    pub fn format_compact(&self) -> String {
        format!(
            "{} {} {} : DbKeeper [{}]{}",
            self.level.symbol(),
            self.pid,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.message,
            self.rendered_fields()
        )
    }

    pub fn format_detailed(&self) -> String {
        let location = match self.line {
            Some(line) => format!(" {}:{}", self.target, line),
            None => format!(" {}", self.target),
        };

        format!(
            "{} {} {} {} : DbKeeper [{}]{}{}",
            self.level.symbol(),
            self.pid,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.message,
            self.rendered_fields(),
            location
        )
    }
}

/// Tracing layer that writes every event as a single DbKeeper line on stderr.
pub struct KeeperTracingLayer {
    detailed: bool,
}

impl KeeperTracingLayer {
    pub fn new(detailed: bool) -> Self {
        Self { detailed }
    }
}

impl<S> tracing_subscriber::Layer<S> for KeeperTracingLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let mut log_event = LogEvent::new(
            LogLevel::from(*metadata.level()),
            visitor.message.unwrap_or_else(|| metadata.name().to_string()),
        );
        log_event.fields = visitor.fields;
        log_event.target = metadata.target().to_string();
        log_event.line = metadata.line();

        let formatted = if self.detailed {
            log_event.format_detailed()
        } else {
            log_event.format_compact()
        };
        eprintln!("{}", formatted);
    }
}

#[derive(Default)]
struct LogVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields.push((field.name().to_string(), format!("{:?}", value)));
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
/// Calling this twice is harmless; the second call reports an error.
pub fn init_tracing_logger(level: LogLevel, detailed: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.filter_directive()));

    Registry::default()
        .with(filter)
        .with(KeeperTracingLayer::new(detailed))
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_display_and_parse() {
        assert_eq!(LogLevel::Info.to_string(), "INFO ");
        assert_eq!(LogLevel::parse("WARNING"), LogLevel::Warning);
        assert_eq!(LogLevel::parse("verbose"), LogLevel::Info);
        assert!(LogLevel::Error > LogLevel::Debug);
    }

    #[test]
    fn test_compact_format_includes_fields() {
        let mut event = LogEvent::new(LogLevel::Warning, "Seed failed".to_string());
        event.fields.push(("seed".to_string(), "002_trips".to_string()));
        let line = event.format_compact();
        assert!(line.starts_with("⚠"));
        assert!(line.contains("DbKeeper [Seed failed] seed=002_trips"));
    }
}
