//! Self-contained leveled logger for the telemetry plane.
//!
//! The telemetry runtime cannot log through itself — an export failure that
//! triggered an error log that triggered an export would loop — so it carries
//! its own minimal logger writing structured lines to stderr. Text output for
//! humans, JSON when running under Kubernetes (detected via
//! `KUBERNETES_SERVICE_HOST`) or forced with `GOMIND_LOG_FORMAT=json`.
//!
//! ERROR lines are rate-limited to one per second: when an OTLP backend goes
//! down every emission fails, and the operator needs one line per second, not
//! ten thousand.
//!
//! Once the registry is initialized the logger also counts its own operations
//! in `gomind.telemetry.operations`, labeled by the low-cardinality fields
//! present on each line. The counter is recorded directly against the
//! instrument table, bypassing the emit pipeline, which keeps the logger
//! reentrancy-free.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::OnceCell;
use opentelemetry::KeyValue;
use regex::Regex;

use crate::telemetry::instruments::MetricInstruments;
use crate::telemetry::ratelimit::RateLimiter;

/// Metric counting logger operations, labeled by level/component/etc.
pub const OPERATIONS_METRIC: &str = "gomind.telemetry.operations";

/// Fields floated to the front of text-format lines for readability
const PRIORITY_FIELDS: [&str; 4] = ["endpoint", "error", "action", "impact"];

/// Fields allowed onto the operations counter; everything else is
/// potentially high-cardinality and stays in the log line only.
const COUNTER_FIELDS: [&str; 5] = ["component", "operation", "status", "error_type", "provider"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Regex-based scrubber applied to field values before they reach a sink.
pub struct PiiRedactor {
    patterns: Vec<Regex>,
}

impl PiiRedactor {
    /// Compile the configured patterns, skipping ones that fail to parse.
    pub fn new(patterns: &[String]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect();
        Self { patterns: compiled }
    }

    pub fn redact(&self, value: &str) -> String {
        let mut out = value.to_string();
        for pattern in &self.patterns {
            out = pattern.replace_all(&out, "[REDACTED]").to_string();
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Leveled, structured, rate-limited logger for telemetry self-observation.
pub struct TelemetryLogger {
    service: String,
    level: LogLevel,
    format: LogFormat,
    error_limiter: RateLimiter,
    redactor: Option<PiiRedactor>,
    ops_sink: RwLock<Option<Arc<MetricInstruments>>>,
}

static GLOBAL_LOGGER: OnceCell<Arc<TelemetryLogger>> = OnceCell::new();

impl TelemetryLogger {
    /// Build a logger, reading level and format from the environment.
    ///
    /// `GOMIND_LOG_LEVEL` sets the level, `GOMIND_DEBUG=true` forces DEBUG,
    /// `GOMIND_LOG_FORMAT=json` or a Kubernetes environment selects JSON.
    pub fn from_env(service: impl Into<String>, redactor: Option<PiiRedactor>) -> Self {
        let level = if matches!(
            std::env::var("GOMIND_DEBUG").as_deref(),
            Ok("true") | Ok("1")
        ) {
            LogLevel::Debug
        } else {
            std::env::var("GOMIND_LOG_LEVEL")
                .ok()
                .and_then(|raw| LogLevel::parse(&raw))
                .unwrap_or(LogLevel::Info)
        };

        let format = match std::env::var("GOMIND_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("text") => LogFormat::Text,
            _ => {
                if std::env::var("KUBERNETES_SERVICE_HOST").is_ok() {
                    LogFormat::Json
                } else {
                    LogFormat::Text
                }
            }
        };

        Self::new(service, level, format, redactor)
    }

    pub fn new(
        service: impl Into<String>,
        level: LogLevel,
        format: LogFormat,
        redactor: Option<PiiRedactor>,
    ) -> Self {
        Self {
            service: service.into(),
            level,
            format,
            error_limiter: RateLimiter::new(Duration::from_secs(1)),
            redactor: redactor.filter(|r| !r.is_empty()),
            ops_sink: RwLock::new(None),
        }
    }

    /// Process-wide logger instance. The first caller's configuration wins.
    pub fn global(service: &str, redactor: Option<PiiRedactor>) -> Arc<TelemetryLogger> {
        GLOBAL_LOGGER
            .get_or_init(|| Arc::new(TelemetryLogger::from_env(service, redactor)))
            .clone()
    }

    /// Attach (or detach) the instrument table used for the operations
    /// counter. Wired by registry initialization and shutdown.
    pub fn set_ops_sink(&self, sink: Option<Arc<MetricInstruments>>) {
        if let Ok(mut slot) = self.ops_sink.write() {
            *slot = sink;
        }
    }

    pub fn debug(&self, message: &str, fields: &[(&str, &str)]) {
        self.log(LogLevel::Debug, message, fields);
    }

    pub fn info(&self, message: &str, fields: &[(&str, &str)]) {
        self.log(LogLevel::Info, message, fields);
    }

    pub fn warn(&self, message: &str, fields: &[(&str, &str)]) {
        self.log(LogLevel::Warn, message, fields);
    }

    /// Rate-limited at one line per second; suppressed lines still count
    /// toward the operations metric so the suppression itself is visible.
    pub fn error(&self, message: &str, fields: &[(&str, &str)]) {
        self.record_operation(LogLevel::Error, fields);
        if !self.error_limiter.allow() {
            return;
        }
        self.write_line(LogLevel::Error, message, fields);
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    fn log(&self, level: LogLevel, message: &str, fields: &[(&str, &str)]) {
        self.record_operation(level, fields);
        if level < self.level {
            return;
        }
        self.write_line(level, message, fields);
    }

    fn write_line(&self, level: LogLevel, message: &str, fields: &[(&str, &str)]) {
        match self.format {
            LogFormat::Json => eprintln!("{}", self.render_json(level, message, fields)),
            LogFormat::Text => eprintln!("{}", self.render_text(level, message, fields)),
        }
    }

    fn render_json(&self, level: LogLevel, message: &str, fields: &[(&str, &str)]) -> String {
        let mut line = serde_json::Map::new();
        line.insert(
            "timestamp".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );
        line.insert(
            "level".to_string(),
            serde_json::Value::String(level.as_str().to_string()),
        );
        line.insert(
            "service".to_string(),
            serde_json::Value::String(self.service.clone()),
        );
        line.insert(
            "message".to_string(),
            serde_json::Value::String(message.to_string()),
        );
        for (key, value) in fields {
            line.insert(
                key.to_string(),
                serde_json::Value::String(self.scrub(value)),
            );
        }
        serde_json::Value::Object(line).to_string()
    }

    fn render_text(&self, level: LogLevel, message: &str, fields: &[(&str, &str)]) -> String {
        let mut line = format!(
            "{} {:5} [{}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            level.as_str(),
            self.service,
            message
        );

        let mut remaining: BTreeMap<&str, &str> = fields.iter().copied().collect();
        for key in PRIORITY_FIELDS {
            if let Some(value) = remaining.remove(key) {
                line.push_str(&format!(" {}={}", key, self.scrub(value)));
            }
        }
        for (key, value) in remaining {
            line.push_str(&format!(" {}={}", key, self.scrub(value)));
        }
        line
    }

    fn scrub(&self, value: &str) -> String {
        match &self.redactor {
            Some(redactor) => redactor.redact(value),
            None => value.to_string(),
        }
    }

    fn record_operation(&self, level: LogLevel, fields: &[(&str, &str)]) {
        let sink = match self.ops_sink.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let Some(sink) = sink else { return };

        let mut labels = vec![
            KeyValue::new("level", level.as_str()),
            KeyValue::new("service", self.service.clone()),
        ];
        for (key, value) in fields {
            if COUNTER_FIELDS.contains(key) {
                labels.push(KeyValue::new(key.to_string(), value.to_string()));
            }
        }
        sink.record_counter(OPERATIONS_METRIC, 1, &labels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_logger(level: LogLevel) -> TelemetryLogger {
        TelemetryLogger::new("test-service", level, LogFormat::Text, None)
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_text_format_floats_priority_fields() {
        let logger = text_logger(LogLevel::Debug);
        let line = logger.render_text(
            LogLevel::Error,
            "export failed",
            &[
                ("zone", "us-east"),
                ("error", "connection refused"),
                ("endpoint", "localhost:4318"),
            ],
        );
        let endpoint_at = line.find("endpoint=").unwrap();
        let error_at = line.find("error=").unwrap();
        let zone_at = line.find("zone=").unwrap();
        assert!(endpoint_at < zone_at);
        assert!(error_at < zone_at);
    }

    #[test]
    fn test_json_format_includes_fields() {
        let logger = TelemetryLogger::new("svc", LogLevel::Debug, LogFormat::Json, None);
        let line = logger.render_json(LogLevel::Warn, "slow export", &[("duration_ms", "1500")]);
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["level"], "WARN");
        assert_eq!(parsed["service"], "svc");
        assert_eq!(parsed["message"], "slow export");
        assert_eq!(parsed["duration_ms"], "1500");
    }

    #[test]
    fn test_pii_redaction() {
        let redactor = PiiRedactor::new(&[r"\b\d{3}-\d{2}-\d{4}\b".to_string()]);
        let logger = TelemetryLogger::new("svc", LogLevel::Debug, LogFormat::Text, Some(redactor));
        let line = logger.render_text(LogLevel::Info, "user lookup", &[("ssn", "123-45-6789")]);
        assert!(line.contains("[REDACTED]"));
        assert!(!line.contains("123-45-6789"));
    }

    #[test]
    fn test_invalid_redaction_pattern_skipped() {
        let redactor = PiiRedactor::new(&["(unclosed".to_string()]);
        assert!(redactor.is_empty());
    }

    #[test]
    fn test_error_rate_limiting() {
        let logger = text_logger(LogLevel::Info);
        // First admission consumed here; the immediate retry must be denied.
        assert!(logger.error_limiter.allow());
        assert!(!logger.error_limiter.allow());
    }
}
