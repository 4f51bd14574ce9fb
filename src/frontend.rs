// The compiler frontend as an invokable service
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::diagnostics::{Diagnostic, DiagnosticBridge, DiagnosticCategory};
use crate::error::{LangCtxError, ProcessError, Result};
use crate::process::{ProcessConfig, ProcessManager};
use crate::target::ImageId;

/// Compile a textual interface into binary module content
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub module: String,
    pub interface: PathBuf,
    pub compiler: PathBuf,
    /// Sanitized options the module is compiled with
    pub options: Vec<String>,
    pub search_paths: Vec<PathBuf>,
    pub fingerprint: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutput {
    /// Serialized module content; the cache wraps it in its artifact header
    pub payload: Vec<u8>,
}

/// A macro use the evaluator needs expanded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MacroInvocation {
    pub macro_name: String,
    /// Module that declares the macro
    pub module: String,
    /// Build directory the macro's plugins were built into
    pub build_dir: PathBuf,
    pub source: String,
    #[serde(default)]
    pub image: Option<ImageId>,
}

#[derive(Debug, Clone)]
pub struct MacroExpansionRequest {
    pub invocation: MacroInvocation,
    pub compiler: PathBuf,
    pub plugin_server: PathBuf,
    pub options: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionOutput {
    pub source: String,
}

/// Result of a successful macro expansion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpandedSource {
    pub macro_name: String,
    pub source: String,
    pub plugin_server: PathBuf,
    pub warnings: Vec<Diagnostic>,
}

/// The compiler frontend. Implementations report every diagnostic through the
/// bridge; an `Err` return is reserved for failures to run the frontend at all.
pub trait Frontend: Send + Sync {
    fn compile_interface(
        &self,
        request: &CompileRequest,
        diagnostics: &DiagnosticBridge,
    ) -> Result<CompileOutput>;

    fn expand_macro(
        &self,
        request: &MacroExpansionRequest,
        diagnostics: &DiagnosticBridge,
    ) -> Result<ExpansionOutput>;
}

/// Runs the toolchain compiler as a child process
#[derive(Debug, Clone, Default)]
pub struct ProcessFrontend {
    manager: ProcessManager,
}

impl ProcessFrontend {
    pub fn new(manager: ProcessManager) -> Self {
        Self { manager }
    }

    fn run(
        &self,
        compiler: &Path,
        args: Vec<OsString>,
        timeout: Duration,
        diagnostics: &DiagnosticBridge,
    ) -> Result<Vec<u8>> {
        let config = ProcessConfig::new(compiler.to_string_lossy())
            .with_args(args)
            .with_timeout(timeout);
        let command = config.display_command();
        let result = self.manager.execute(config)?;

        diagnostics.report_output(&result.stderr());
        if !result.success() && !diagnostics.has_errors() {
            // Crashed or failed without a parsable diagnostic
            let stderr = result.stderr();
            let message = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("frontend exited with a failure status")
                .to_string();
            diagnostics.report(Diagnostic::error(DiagnosticCategory::Internal, message));
            debug!(command = %command, exit_code = ?result.exit_code(), "Frontend failed");
        }
        Ok(result.stdout)
    }
}

impl Frontend for ProcessFrontend {
    fn compile_interface(
        &self,
        request: &CompileRequest,
        diagnostics: &DiagnosticBridge,
    ) -> Result<CompileOutput> {
        let scratch = TempDir::new().map_err(LangCtxError::Io)?;
        let output = scratch.path().join(format!("{}.out", request.module));

        let mut args: Vec<OsString> = vec![
            "-frontend".into(),
            "-compile-module-from-interface".into(),
            "-module-name".into(),
            request.module.clone().into(),
            "-o".into(),
            output.clone().into(),
        ];
        for path in &request.search_paths {
            args.push("-I".into());
            args.push(path.clone().into());
        }
        args.extend(request.options.iter().map(OsString::from));
        args.push(request.interface.clone().into());

        info!(
            module = %request.module,
            interface = %request.interface.display(),
            "Compiling module from interface"
        );
        self.run(&request.compiler, args, request.timeout, diagnostics)?;

        if diagnostics.has_errors() {
            return Ok(CompileOutput {
                payload: Vec::new(),
            });
        }
        let payload = std::fs::read(&output).map_err(|e| {
            LangCtxError::from(ProcessError::OutputCaptureFailed {
                message: format!("frontend produced no module at {}: {e}", output.display()),
                command: request.compiler.display().to_string(),
            })
        })?;
        Ok(CompileOutput { payload })
    }

    fn expand_macro(
        &self,
        request: &MacroExpansionRequest,
        diagnostics: &DiagnosticBridge,
    ) -> Result<ExpansionOutput> {
        let scratch = TempDir::new().map_err(LangCtxError::Io)?;
        let input = scratch.path().join("expansion.swift");
        std::fs::write(&input, &request.invocation.source).map_err(LangCtxError::Io)?;

        let plugin_path = format!(
            "{}#{}",
            request.invocation.build_dir.display(),
            request.plugin_server.display()
        );
        let mut args: Vec<OsString> = vec![
            "-frontend".into(),
            "-typecheck".into(),
            "-dump-macro-expansions".into(),
            "-external-plugin-path".into(),
            plugin_path.into(),
        ];
        args.extend(request.options.iter().map(OsString::from));
        args.push(input.into());

        let stdout = self.run(&request.compiler, args, request.timeout, diagnostics)?;
        Ok(ExpansionOutput {
            source: String::from_utf8_lossy(&stdout).to_string(),
        })
    }
}
