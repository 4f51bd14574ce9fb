// Bridge between frontend diagnostics and the evaluator's error surface
//
// Every frontend invocation made by this crate (interface compile, import,
// macro expansion) reports through a `DiagnosticBridge`. Warnings are kept and
// handed back to the caller; any error aborts the operation with a categorized
// `LangCtxError`.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::{LangCtxError, ModuleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Remark,
    Note,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub fn is_error(self) -> bool {
        matches!(self, Severity::Error | Severity::Fatal)
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "remark" => Some(Severity::Remark),
            "note" => Some(Severity::Note),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "fatal error" => Some(Severity::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Severity::Remark => "remark",
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal error",
        };
        f.write_str(text)
    }
}

/// Categorical tag the evaluator can match on without parsing message text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticCategory {
    SyntaxError,
    ModuleBuildFailure,
    ModuleNotFound,
    MacroExpansion,
    Configuration,
    PluginResolution,
    Internal,
}

impl DiagnosticCategory {
    pub fn tag(self) -> &'static str {
        match self {
            DiagnosticCategory::SyntaxError => "SYNTAX_ERROR",
            DiagnosticCategory::ModuleBuildFailure => "MODULE_BUILD_FAILURE",
            DiagnosticCategory::ModuleNotFound => "MODULE_NOT_FOUND",
            DiagnosticCategory::MacroExpansion => "MACRO_EXPANSION_FAILURE",
            DiagnosticCategory::Configuration => "CONFIGURATION_ERROR",
            DiagnosticCategory::PluginResolution => "PLUGIN_RESOLUTION_FAILURE",
            DiagnosticCategory::Internal => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

/// One structured diagnostic produced by the frontend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub category: DiagnosticCategory,
    pub message: String,
    pub code: Option<String>,
    pub location: Option<SourceLocation>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, category: DiagnosticCategory, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            code: None,
            location: None,
            notes: Vec::new(),
        }
    }

    pub fn error(category: DiagnosticCategory, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, category, message)
    }

    pub fn warning(category: DiagnosticCategory, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, category, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_location(mut self, file: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        self.location = Some(SourceLocation {
            file: file.into(),
            line,
            column,
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity.is_error()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(location) = &self.location {
            write!(
                f,
                "{}:{}:{}: ",
                location.file.display(),
                location.line,
                location.column
            )?;
        }
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(code) = &self.code {
            write!(f, " [{code}]")?;
        }
        for note in &self.notes {
            write!(f, "\n  note: {note}")?;
        }
        Ok(())
    }
}

/// The frontend invocation a set of diagnostics belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendOperation {
    CompileInterface {
        module: String,
        interface: Option<PathBuf>,
    },
    Import {
        module: String,
    },
    MacroExpansion {
        macro_name: String,
    },
}

impl FrontendOperation {
    fn default_category(&self) -> DiagnosticCategory {
        match self {
            FrontendOperation::CompileInterface { .. } | FrontendOperation::Import { .. } => {
                DiagnosticCategory::ModuleBuildFailure
            }
            FrontendOperation::MacroExpansion { .. } => DiagnosticCategory::MacroExpansion,
        }
    }
}

static DIAGNOSTIC_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(?P<file>[^:\n]+):(?P<line>\d+)(?::(?P<col>\d+))?:\s*)?(?P<sev>fatal error|error|warning|note|remark):\s*(?P<msg>.*?)(?:\s+\[(?P<code>[^\]]+)\])?\s*$",
    )
    .expect("diagnostic pattern is valid")
});

static SYNTAX_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(expected |unexpected |consecutive statements|unterminated |invalid character|extraneous )")
        .expect("syntax pattern is valid")
});

/// Pick the category of a frontend message within the given operation
pub fn classify(message: &str, operation: &FrontendOperation) -> DiagnosticCategory {
    if SYNTAX_MESSAGE.is_match(message) {
        DiagnosticCategory::SyntaxError
    } else if message.starts_with("no such module") {
        DiagnosticCategory::ModuleNotFound
    } else {
        operation.default_category()
    }
}

/// Parse the textual diagnostic stream a frontend writes to stderr.
/// Notes are attached to the diagnostic they follow; unrecognized lines are ignored.
pub fn parse_frontend_output(output: &str, operation: &FrontendOperation) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    for line in output.lines() {
        let Some(captures) = DIAGNOSTIC_LINE.captures(line.trim_end()) else {
            continue;
        };
        let Some(severity) = captures.name("sev").and_then(|m| Severity::parse(m.as_str()))
        else {
            continue;
        };
        let message = captures
            .name("msg")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        if severity == Severity::Note {
            if let Some(previous) = diagnostics.last_mut() {
                previous.notes.push(message);
                continue;
            }
        }

        let mut diagnostic = Diagnostic::new(severity, classify(&message, operation), message);
        // `<unknown>:0:` carries no usable location
        if let (Some(file), Some(line)) = (captures.name("file"), captures.name("line")) {
            let line = line.as_str().parse().unwrap_or(0);
            if file.as_str() != "<unknown>" && line > 0 {
                let column = captures
                    .name("col")
                    .and_then(|col| col.as_str().parse().ok())
                    .unwrap_or(0);
                diagnostic = diagnostic.with_location(file.as_str(), line, column);
            }
        }
        if let Some(code) = captures.name("code") {
            diagnostic = diagnostic.with_code(code.as_str());
        }
        diagnostics.push(diagnostic);
    }

    diagnostics
}

/// Collects diagnostics for one frontend invocation
pub struct DiagnosticBridge {
    operation: FrontendOperation,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl DiagnosticBridge {
    pub fn new(operation: FrontendOperation) -> Self {
        Self {
            operation,
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    pub fn operation(&self) -> &FrontendOperation {
        &self.operation
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        if diagnostic.severity == Severity::Warning {
            warn!(operation = ?self.operation, "{}", diagnostic);
        } else {
            debug!(operation = ?self.operation, "{}", diagnostic);
        }
        self.diagnostics.lock().push(diagnostic);
    }

    pub fn report_all(&self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for diagnostic in diagnostics {
            self.report(diagnostic);
        }
    }

    /// Parse raw frontend output and report every diagnostic found in it
    pub fn report_output(&self, output: &str) {
        let parsed = parse_frontend_output(output, &self.operation);
        self.report_all(parsed);
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.lock().iter().any(Diagnostic::is_error)
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Finish the operation: `Ok(warnings)` when no error was reported,
    /// otherwise the translated error carrying every diagnostic.
    pub fn finish(self) -> Result<Vec<Diagnostic>> {
        let diagnostics = self.diagnostics.into_inner();
        if !diagnostics.iter().any(Diagnostic::is_error) {
            return Ok(diagnostics
                .into_iter()
                .filter(|d| d.severity == Severity::Warning)
                .collect());
        }

        let error = match self.operation {
            FrontendOperation::CompileInterface { module, interface } => ModuleError::BuildFailure {
                message: format!("could not build module '{module}'"),
                module,
                interface,
                diagnostics,
            },
            FrontendOperation::Import { module } => ModuleError::BuildFailure {
                message: format!("could not build module '{module}'"),
                module,
                interface: None,
                diagnostics,
            },
            FrontendOperation::MacroExpansion { macro_name } => {
                let message = diagnostics
                    .iter()
                    .find(|d| d.is_error())
                    .map(|d| d.message.clone())
                    .unwrap_or_default();
                ModuleError::MacroExpansionFailed {
                    macro_name,
                    message,
                    diagnostics,
                }
            }
        };
        Err(LangCtxError::from(error))
    }
}

/// Structured error returned to the expression evaluator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorError {
    pub category: DiagnosticCategory,
    pub message: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl EvaluatorError {
    pub fn new(category: DiagnosticCategory, message: String, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            category,
            message,
            diagnostics,
        }
    }

    pub fn tag(&self) -> &'static str {
        self.category.tag()
    }
}

impl fmt::Display for EvaluatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error: [{}] {}", self.tag(), self.message)?;
        for diagnostic in &self.diagnostics {
            write!(f, "\n  [{}] {diagnostic}", diagnostic.category.tag())?;
        }
        Ok(())
    }
}

impl From<&LangCtxError> for EvaluatorError {
    fn from(error: &LangCtxError) -> Self {
        error.to_evaluator_error()
    }
}
