// Logging for langctx: tracing subscriber setup and the in-memory health log
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::io::{self, IsTerminal};
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{ConfigurationError, LangCtxError, Result};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format (pretty for terminals, json for programmatic use)
    pub format: LogFormat,
    pub color: ColorConfig,
    /// Whether to show targets (module names)
    pub show_targets: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColorConfig {
    Auto,
    Always,
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            color: ColorConfig::Auto,
            show_targets: false,
        }
    }
}

impl LogConfig {
    /// Create logging configuration from CLI arguments
    pub fn from_cli(verbose: bool, quiet: bool, color: Option<String>, json: bool) -> Self {
        let level = if quiet {
            Level::ERROR
        } else if verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };

        let color = match color.as_deref() {
            Some("always") => ColorConfig::Always,
            Some("never") => ColorConfig::Never,
            _ => ColorConfig::Auto,
        };

        Self {
            level,
            format: if json { LogFormat::Json } else { LogFormat::Pretty },
            color,
            show_targets: verbose,
        }
    }

    pub fn should_use_colors(&self) -> bool {
        match self.color {
            ColorConfig::Always => true,
            ColorConfig::Never => false,
            ColorConfig::Auto => {
                io::stderr().is_terminal()
                    && std::env::var("TERM").map_or(true, |term| term != "dumb")
                    && std::env::var("NO_COLOR").is_err()
            }
        }
    }
}

/// Install the global tracing subscriber. `RUST_LOG` directives are added on top
/// of the configured level.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let mut env_filter = EnvFilter::new(format!("langctx={}", config.level));
    if let Ok(directives) = std::env::var("RUST_LOG") {
        for directive in directives.split(',').filter(|d| !d.trim().is_empty()) {
            let parsed: Directive = directive.trim().parse().map_err(|e| {
                LangCtxError::from(ConfigurationError::InvalidSettings {
                    message: format!("invalid RUST_LOG directive '{directive}': {e}"),
                    file_path: None,
                    line: None,
                })
            })?;
            env_filter = env_filter.add_directive(parsed);
        }
    }

    let use_colors = config.should_use_colors();
    let builder = fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(config.show_targets);

    // A subscriber may already be installed (tests, embedding debugger); keep it.
    let _ = match config.format {
        LogFormat::Pretty => builder.with_ansi(use_colors).try_init(),
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().with_ansi(use_colors).try_init(),
    };

    Ok(())
}

/// One entry of the health log
#[derive(Debug, Clone, PartialEq)]
pub struct HealthEntry {
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub message: String,
}

impl HealthEntry {
    fn render(&self) -> String {
        format!(
            "{} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
            self.label,
            self.message
        )
    }
}

/// In-memory, thread-safe record of configuration and cache events that can be
/// dumped after an error. Every entry is mirrored to `tracing` at debug level.
#[derive(Debug)]
pub struct HealthLog {
    header: String,
    entries: Mutex<Vec<HealthEntry>>,
}

impl Default for HealthLog {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthLog {
    pub fn new() -> Self {
        Self {
            header: format!("==== langctx health log ({}) ====", crate::version_info()),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    /// Append an entry; multi-line messages stay a single entry
    pub fn record(&self, label: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(target: "langctx::health", label = %label, "{}", message);
        self.entries.lock().push(HealthEntry {
            timestamp: Utc::now(),
            label: label.to_string(),
            message,
        });
    }

    pub fn entries(&self) -> Vec<HealthEntry> {
        self.entries.lock().clone()
    }

    /// Rendered lines: the header followed by one line per physical message line
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![self.header.clone()];
        for entry in self.entries.lock().iter() {
            lines.extend(entry.render().lines().map(str::to_string));
        }
        lines
    }

    /// Rendered lines containing `needle`
    pub fn lines_matching(&self, needle: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.contains(needle))
            .collect()
    }

    /// Number of entries recorded under exactly this label
    pub fn count_label(&self, label: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.label == label)
            .count()
    }

    pub fn dump(&self) -> String {
        self.lines().join("\n")
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Logging utilities for common operations
pub mod utils {
    use std::path::Path;
    use tracing::{debug, info, span, Level, Span};

    use crate::target::TargetId;

    pub fn context_construction_span(target: TargetId) -> Span {
        span!(Level::INFO, "context_construction", target = %target)
    }

    pub fn module_resolution_span(target: TargetId, module: &str) -> Span {
        span!(Level::DEBUG, "module_resolution", target = %target, module = %module)
    }

    pub fn log_cache_event(event: &str, module: &str, path: &Path) {
        if event == "hit" {
            debug!(event = %event, module = %module, path = %path.display(), "module cache event");
        } else {
            info!(event = %event, module = %module, path = %path.display(), "module cache event");
        }
    }
}
