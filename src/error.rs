// Error handling for langctx
use std::path::PathBuf;
use thiserror::Error;

use crate::diagnostics::{Diagnostic, DiagnosticCategory, EvaluatorError};
use crate::target::TargetId;

pub type Result<T> = std::result::Result<T, LangCtxError>;

/// Main error type with the full error hierarchy
#[derive(Debug, Error)]
pub enum LangCtxError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<ConfigurationError>),

    #[error("Module error: {0}")]
    Module(#[from] Box<ModuleError>),

    #[error("Plugin server resolution failed: {0}")]
    Plugin(#[from] Box<PluginError>),

    #[error("Process execution failed: {0}")]
    Process(#[from] Box<ProcessError>),

    #[error("Language context error: {0}")]
    Context(#[from] Box<ContextError>),

    #[error("Secondary language importer is disabled (use-secondary-importer = false)")]
    Disabled,

    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while building the configuration of a language context.
/// These are fatal to context construction.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Toolchain not found for {target}")]
    ToolchainNotFound {
        target: TargetId,
        attempted: Vec<PathBuf>,
        suggestion: Option<String>,
    },

    #[error("No default runtime library paths for {target}: {reason}")]
    NoDefaultSearchPaths { target: TargetId, reason: String },

    #[error("Invalid settings: {message}")]
    InvalidSettings {
        message: String,
        file_path: Option<PathBuf>,
        line: Option<u32>,
    },

    #[error("Settings file not found: {path}")]
    SettingsNotFound { path: PathBuf },

    #[error("Invalid target description: {message}")]
    InvalidTarget {
        message: String,
        file_path: Option<PathBuf>,
    },

    #[error("Module cache directory unavailable: {path}")]
    CacheDirectoryFailed { path: PathBuf, error: String },
}

/// Per-import errors. None of these invalidate the owning context.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("no such module '{module}'")]
    NotFound {
        module: String,
        searched: Vec<PathBuf>,
    },

    #[error("invalid module name '{module}'")]
    InvalidName { module: String },

    #[error("{message}")]
    BuildFailure {
        module: String,
        interface: Option<PathBuf>,
        message: String,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("Invalid cached module '{module}' at {path}: {reason}")]
    CacheCorruption {
        module: String,
        path: PathBuf,
        reason: String,
    },

    #[error("macro expansion of '{macro_name}' failed: {message}")]
    MacroExpansionFailed {
        macro_name: String,
        message: String,
        diagnostics: Vec<Diagnostic>,
    },
}

/// Plugin worker discovery errors; they only affect macro expansion
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("could not find plugin server for {build_dir}, tried {attempted:?}")]
    NotFound {
        build_dir: PathBuf,
        compiler: PathBuf,
        attempted: Vec<PathBuf>,
    },

    #[error("no compiler path known for {build_dir}; cannot derive a plugin server")]
    NoCompiler { build_dir: PathBuf },
}

/// Process execution errors with detailed context
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Process execution failed: {command}")]
    ExecutionFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Process timeout after {duration:?}: {command}")]
    Timeout {
        command: String,
        duration: std::time::Duration,
    },

    #[error("Process spawn failed: {command}")]
    SpawnFailed { command: String, error: String },

    #[error("Output capture failed: {message}")]
    OutputCaptureFailed { message: String, command: String },
}

/// Lifecycle errors of a language context
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("{target} was torn down while the request was in flight")]
    TornDown { target: TargetId },

    #[error("language context for {target} could not be constructed: {reason}")]
    ConstructionFailed { target: TargetId, reason: String },
}

impl From<ConfigurationError> for LangCtxError {
    fn from(error: ConfigurationError) -> Self {
        LangCtxError::Config(Box::new(error))
    }
}

impl From<ModuleError> for LangCtxError {
    fn from(error: ModuleError) -> Self {
        LangCtxError::Module(Box::new(error))
    }
}

impl From<PluginError> for LangCtxError {
    fn from(error: PluginError) -> Self {
        LangCtxError::Plugin(Box::new(error))
    }
}

impl From<ProcessError> for LangCtxError {
    fn from(error: ProcessError) -> Self {
        LangCtxError::Process(Box::new(error))
    }
}

impl From<ContextError> for LangCtxError {
    fn from(error: ContextError) -> Self {
        LangCtxError::Context(Box::new(error))
    }
}

// Conversion from serde_yaml::Error to ConfigurationError
impl From<serde_yaml::Error> for Box<ConfigurationError> {
    fn from(error: serde_yaml::Error) -> Self {
        let location = error.location();
        Box::new(ConfigurationError::InvalidSettings {
            message: error.to_string(),
            file_path: None,
            line: location.as_ref().map(|l| l.line() as u32),
        })
    }
}

/// Format errors with colors and context
pub struct ErrorFormatter {
    use_colors: bool,
}

impl ErrorFormatter {
    pub fn new(use_colors: bool) -> Self {
        Self { use_colors }
    }

    /// Format an error with context and colors
    pub fn format_error(&self, error: &LangCtxError) -> String {
        use tracing::error;

        let category = error.category();
        error!(
            error_type = category.tag(),
            error = %error,
            "langctx operation failed"
        );

        let mut output = String::new();
        if self.use_colors {
            output.push_str("\x1b[31m");
        }
        output.push_str("Error: ");
        if self.use_colors {
            output.push_str("\x1b[0m");
        }
        output.push_str(&error.to_string());

        match error {
            LangCtxError::Config(config_err) => {
                self.add_config_context(&mut output, config_err.as_ref())
            }
            LangCtxError::Module(module_err) => {
                self.add_module_context(&mut output, module_err.as_ref())
            }
            LangCtxError::Plugin(plugin_err) => {
                if let PluginError::NotFound { attempted, .. } = plugin_err.as_ref() {
                    for path in attempted {
                        output.push_str(&format!("\n  Tried: {}", path.display()));
                    }
                }
            }
            LangCtxError::Process(process_err) => {
                if let ProcessError::ExecutionFailed { stderr, .. } = process_err.as_ref() {
                    if !stderr.is_empty() {
                        output.push_str(&format!("\n  Process error: {stderr}"));
                    }
                }
            }
            _ => {}
        }

        output
    }

    fn add_config_context(&self, output: &mut String, error: &ConfigurationError) {
        match error {
            ConfigurationError::ToolchainNotFound {
                attempted,
                suggestion,
                ..
            } => {
                for path in attempted {
                    output.push_str(&format!("\n  Tried: {}", path.display()));
                }
                if let Some(suggestion) = suggestion {
                    output.push_str(&format!("\n  Help: {suggestion}"));
                }
            }
            ConfigurationError::InvalidSettings {
                file_path: Some(path),
                line: Some(line),
                ..
            } => {
                output.push_str(&format!("\n  --> {}:{}", path.display(), line));
            }
            _ => {}
        }
    }

    fn add_module_context(&self, output: &mut String, error: &ModuleError) {
        match error {
            ModuleError::NotFound { searched, .. } if !searched.is_empty() => {
                output.push_str("\n  Searched:");
                for path in searched {
                    output.push_str(&format!("\n    {}", path.display()));
                }
            }
            ModuleError::BuildFailure { diagnostics, .. }
            | ModuleError::MacroExpansionFailed { diagnostics, .. } => {
                for diagnostic in diagnostics {
                    output.push_str(&format!("\n  {diagnostic}"));
                }
            }
            _ => {}
        }
    }
}

/// Exit codes used by the command line front end
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const MODULE_NOT_FOUND: i32 = 3;
    pub const MODULE_BUILD_FAILURE: i32 = 4;
    pub const PLUGIN_ERROR: i32 = 5;
    pub const TIMEOUT_ERROR: i32 = 6;
    pub const DISABLED: i32 = 7;
}

impl LangCtxError {
    /// Stable category used by the evaluator to pattern-match on failures
    pub fn category(&self) -> DiagnosticCategory {
        match self {
            LangCtxError::Config(_) | LangCtxError::Disabled => DiagnosticCategory::Configuration,
            LangCtxError::Module(module_err) => match module_err.as_ref() {
                ModuleError::NotFound { .. } | ModuleError::InvalidName { .. } => {
                    DiagnosticCategory::ModuleNotFound
                }
                ModuleError::BuildFailure { .. } => DiagnosticCategory::ModuleBuildFailure,
                ModuleError::MacroExpansionFailed { .. } => DiagnosticCategory::MacroExpansion,
                ModuleError::CacheCorruption { .. } => DiagnosticCategory::Internal,
            },
            LangCtxError::Plugin(_) => DiagnosticCategory::PluginResolution,
            LangCtxError::Process(_) | LangCtxError::Context(_) | LangCtxError::Io(_) => {
                DiagnosticCategory::Internal
            }
        }
    }

    /// Nested frontend diagnostics carried by this error, if any
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            LangCtxError::Module(module_err) => match module_err.as_ref() {
                ModuleError::BuildFailure { diagnostics, .. }
                | ModuleError::MacroExpansionFailed { diagnostics, .. } => diagnostics,
                _ => &[],
            },
            _ => &[],
        }
    }

    /// Translate into the evaluator-facing error value
    pub fn to_evaluator_error(&self) -> EvaluatorError {
        EvaluatorError::new(self.category(), self.to_string(), self.diagnostics().to_vec())
    }

    /// Get the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            LangCtxError::Config(_) => exit_codes::CONFIG_ERROR,
            LangCtxError::Disabled => exit_codes::DISABLED,
            LangCtxError::Module(module_err) => match module_err.as_ref() {
                ModuleError::NotFound { .. } | ModuleError::InvalidName { .. } => {
                    exit_codes::MODULE_NOT_FOUND
                }
                ModuleError::BuildFailure { .. } | ModuleError::MacroExpansionFailed { .. } => {
                    exit_codes::MODULE_BUILD_FAILURE
                }
                ModuleError::CacheCorruption { .. } => exit_codes::GENERAL_ERROR,
            },
            LangCtxError::Plugin(_) => exit_codes::PLUGIN_ERROR,
            LangCtxError::Process(process_err) => match process_err.as_ref() {
                ProcessError::Timeout { .. } => exit_codes::TIMEOUT_ERROR,
                _ => exit_codes::GENERAL_ERROR,
            },
            LangCtxError::Context(_) | LangCtxError::Io(_) => exit_codes::GENERAL_ERROR,
        }
    }

    /// Create a user-friendly error message with context
    pub fn user_message(&self, use_colors: bool) -> String {
        ErrorFormatter::new(use_colors).format_error(self)
    }
}
