// langctx - Library module
// Per-target language contexts, option sanitizing and the module cache used
// by a debugger's expression evaluator

pub mod cli;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod frontend;
pub mod logging;
pub mod module_cache;
pub mod options;
pub mod plugin_server;
pub mod process;
pub mod reflection;
pub mod registry;
pub mod target;
pub mod toolchain;

// Re-export main types for easier access
pub use config::Settings;
pub use context::{ContextServices, LanguageContext, CONFIGURATION_LOG_LABEL};
pub use diagnostics::{
    Diagnostic, DiagnosticBridge, DiagnosticCategory, EvaluatorError, FrontendOperation, Severity,
    SourceLocation,
};
pub use error::{
    exit_codes, ConfigurationError, ContextError, ErrorFormatter, LangCtxError, ModuleError,
    PluginError, ProcessError, Result,
};
pub use frontend::{
    CompileOutput, CompileRequest, ExpandedSource, ExpansionOutput, Frontend,
    MacroExpansionRequest, MacroInvocation, ProcessFrontend,
};
pub use logging::{ColorConfig, HealthLog, LogConfig, LogFormat};
pub use module_cache::{
    CacheDirectorySet, CacheEvent, CacheMetricsSnapshot, CacheTier, Fingerprint,
    ModuleCacheEntry, ModuleCacheManager, ResolveRequest, ResolvedModule, CACHE_EVENT_LABEL,
};
pub use options::{
    ImageOptions, MacroConflict, MacroDefinition, MacroDirective, MacroPolicy, OptionSanitizer,
    SanitizedOption, SanitizedOptionSet,
};
pub use plugin_server::{CandidateRule, PluginServerRegistry, PluginServerResolver};
pub use process::{ProcessConfig, ProcessManager, ProcessResult};
pub use reflection::{
    CacheInvalidationTrigger, DebugInfoState, ImageEvent, NoTypeInfo, ReflectionCache,
    TriggerOutcome, TypeInfo, TypeInfoProvider,
};
pub use registry::ContextRegistry;
pub use target::{ImageId, ImageInfo, Target, TargetId};
pub use toolchain::{DefaultSearchPaths, SearchPathReconstructor, Toolchain};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

// Build information (set by build script)
pub const BUILD_DATE: &str = env!("LANGCTX_BUILD_DATE");
pub const GIT_COMMIT: &str = env!("LANGCTX_GIT_COMMIT");
pub const RUST_VERSION: &str = env!("LANGCTX_RUST_VERSION");

/// Get formatted version string with build information
pub fn version_info() -> String {
    format!("{NAME} {VERSION} (commit: {GIT_COMMIT}, built: {BUILD_DATE}, rustc: {RUST_VERSION})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(
            parts.len() >= 3,
            "VERSION '{VERSION}' should have at least 3 parts separated by dots (X.Y.Z)"
        );

        for (i, part) in parts.iter().take(3).enumerate() {
            let number_part = if i == 2 {
                // Third part might have a suffix (e.g., "0-alpha1")
                part.split('-').next().unwrap_or(part)
            } else {
                part
            };

            assert!(
                number_part.chars().all(|c| c.is_ascii_digit()),
                "VERSION '{VERSION}' part '{number_part}' should be a number"
            );
        }
    }

    #[test]
    fn test_name_constant() {
        assert_eq!(NAME, "langctx");
    }

    #[test]
    fn test_version_info() {
        let info = version_info();
        assert!(info.starts_with("langctx "));
        assert!(info.contains(VERSION));
        assert!(DESCRIPTION.contains("module cache"));
    }
}
