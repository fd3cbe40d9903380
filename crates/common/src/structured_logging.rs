use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Once;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use chrono::Utc;

use crate::env;

/// One JSON log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredLogEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub level: String,
    /// Module path of the event
    pub target: String,
    pub message: String,
    /// Structured fields recorded on the event
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ExecutionContext>,
}

/// Process level context attached to every JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub app_version: String,
    pub hostname: String,
    pub pid: u32,
    pub thread_id: String,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            thread_id: format!("{:?}", std::thread::current().id()),
        }
    }
}

/// Layer that renders every event as a single JSON line on stdout.
pub struct JsonFormatter {
    include_context: bool,
}

impl JsonFormatter {
    pub fn new(include_context: bool) -> Self {
        Self { include_context }
    }

    fn render(&self, event: &Event<'_>) -> StructuredLogEntry {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN",
            Level::INFO => "INFO",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };

        StructuredLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            context: self.include_context.then(ExecutionContext::default),
        }
    }
}

impl<S> Layer<S> for JsonFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let entry = self.render(event);
        if let Ok(json) = serde_json::to_string(&entry) {
            let _ = writeln!(io::stdout(), "{}", json);
        }
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: HashMap<String, Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.insert(field, Value::String(format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }
}

/// Settings for [`init_structured_logging`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum level when `RUST_LOG` is not set
    pub level: Level,
    /// Emit JSON lines instead of the human readable format
    pub json_output: bool,
    /// ANSI colors, human readable format only
    pub color_output: bool,
    /// Attach [`ExecutionContext`] to JSON lines
    pub include_context: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_output: false,
            color_output: true,
            include_context: true,
            include_line_numbers: cfg!(debug_assertions),
        }
    }
}

impl LoggingConfig {
    /// Defaults overridden by `AGENT_LOG_LEVEL` and `AGENT_LOG_JSON`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(level) = env::var_parse::<Level>("AGENT_LOG_LEVEL") {
            cfg.level = level;
        }
        if let Some(json) = env::var_flag("AGENT_LOG_JSON") {
            cfg.json_output = json;
            cfg.color_output = !json;
        }
        cfg
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_structured_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    if config.json_output {
        let subscriber = Registry::default()
            .with(env_filter)
            .with(JsonFormatter::new(config.include_context));

        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(config.include_line_numbers)
            .with_ansi(config.color_output)
            .with_span_events(FmtSpan::CLOSE);

        let subscriber = Registry::default().with(env_filter).with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

static TEST_LOGGING: Once = Once::new();

/// Route logs through the libtest capture. Safe to call from every test.
pub fn init_test_logging() {
    TEST_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Measures an operation and logs its duration once finished.
pub struct OperationTimer {
    start: std::time::Instant,
    operation_name: String,
}

impl OperationTimer {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            start: std::time::Instant::now(),
            operation_name: operation_name.into(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: &Result<T, E>) -> u64 {
        let duration_ms = self.elapsed_ms();
        match result {
            Ok(_) => tracing::debug!(
                operation = %self.operation_name,
                duration_ms,
                success = true,
                "Operation completed"
            ),
            Err(e) => tracing::warn!(
                operation = %self.operation_name,
                duration_ms,
                success = false,
                error = %e,
                "Operation failed"
            ),
        }
        duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_log_entry_serialization() {
        let mut fields = HashMap::new();
        fields.insert("task_id".to_string(), Value::String("t-1".into()));
        let entry = StructuredLogEntry {
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            level: "INFO".to_string(),
            target: "orchestrator::runtime".to_string(),
            message: "Task accepted".to_string(),
            fields,
            context: Some(ExecutionContext::default()),
        };

        let json = serde_json::to_string(&entry).expect("entry serializes");
        assert!(json.contains("\"task_id\":\"t-1\""));
        assert!(json.contains("Task accepted"));
        assert!(json.contains("hostname"));
    }

    type Slot = std::sync::Arc<std::sync::Mutex<Option<StructuredLogEntry>>>;

    struct Capture(Slot);

    impl<S> Layer<S> for Capture
    where
        S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            let entry = JsonFormatter::new(false).render(event);
            *self.0.lock().expect("slot lock") = Some(entry);
        }
    }

    #[test]
    fn test_json_formatter_collects_fields() {
        let slot: Slot = Default::default();
        let subscriber = Registry::default().with(Capture(slot.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(queue_depth = 3u64, degraded = true, "Health sampled");
        });

        let entry = slot.lock().expect("slot lock").take().expect("event captured");
        assert_eq!(entry.level, "INFO");
        assert_eq!(entry.message, "Health sampled");
        assert_eq!(entry.fields.get("queue_depth"), Some(&Value::from(3u64)));
        assert_eq!(entry.fields.get("degraded"), Some(&Value::Bool(true)));
        assert!(entry.context.is_none());
    }

    #[test]
    fn test_operation_timer_reports_duration() {
        init_test_logging();
        let timer = OperationTimer::new("checkpoint.save");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let ok: Result<(), String> = Ok(());
        assert!(timer.finish_with_result(&ok) >= 5);
    }
}
