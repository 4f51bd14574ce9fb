// Shared fixtures for integration tests: a fake toolchain layout, a target
// description and a frontend that counts its compiles

use langctx::diagnostics::{Diagnostic, DiagnosticBridge, DiagnosticCategory};
use langctx::frontend::{
    CompileOutput, CompileRequest, ExpansionOutput, Frontend, MacroExpansionRequest,
};
use langctx::plugin_server::PluginServerRegistry;
use langctx::{ContextRegistry, ImageId, ImageInfo, Settings, Target, TargetId};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Frontend that "compiles" an interface into its own text. Interfaces
/// starting with `garbage` fail with a syntax error.
#[derive(Default)]
pub struct CountingFrontend {
    compiles: AtomicUsize,
    expansions: AtomicUsize,
    delay: Option<Duration>,
}

#[allow(dead_code)]
impl CountingFrontend {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn expansions(&self) -> usize {
        self.expansions.load(Ordering::SeqCst)
    }
}

impl Frontend for CountingFrontend {
    fn compile_interface(
        &self,
        request: &CompileRequest,
        diagnostics: &DiagnosticBridge,
    ) -> langctx::Result<CompileOutput> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let source = fs::read_to_string(&request.interface)?;
        if source.starts_with("garbage") {
            diagnostics.report_output(&format!(
                "{}:1:1: error: expected declaration",
                request.interface.display()
            ));
            return Ok(CompileOutput {
                payload: Vec::new(),
            });
        }

        // Each compile sees the macros of the compilation it serves
        let mut payload = source.into_bytes();
        for option in &request.options {
            payload.extend_from_slice(b"\n");
            payload.extend_from_slice(option.as_bytes());
        }
        Ok(CompileOutput { payload })
    }

    fn expand_macro(
        &self,
        request: &MacroExpansionRequest,
        diagnostics: &DiagnosticBridge,
    ) -> langctx::Result<ExpansionOutput> {
        self.expansions.fetch_add(1, Ordering::SeqCst);
        if request.invocation.source.contains("#error") {
            diagnostics.report(Diagnostic::error(
                DiagnosticCategory::MacroExpansion,
                "external macro implementation type could not be found",
            ));
        }
        Ok(ExpansionOutput {
            source: format!("/* {} */ {}", request.invocation.macro_name, request.invocation.source),
        })
    }
}

/// A toolchain, SDK, build directory and cache directory under one temp root
pub struct Workspace {
    pub root: TempDir,
}

#[allow(dead_code)]
impl Workspace {
    pub fn new() -> anyhow::Result<Self> {
        let root = TempDir::new()?;
        fs::create_dir_all(root.path().join("toolchain/usr/bin"))?;
        fs::create_dir_all(root.path().join("toolchain/usr/lib/swift/linux/prebuilt-modules"))?;
        fs::create_dir_all(root.path().join("sdk/usr/lib/swift"))?;
        fs::create_dir_all(root.path().join("build"))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn toolchain(&self) -> PathBuf {
        self.path().join("toolchain")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.path().join("build")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.path().join("cache")
    }

    pub fn prebuilt_dir(&self) -> PathBuf {
        self.toolchain().join("usr/lib/swift/linux/prebuilt-modules")
    }

    /// Write `<build>/<module>.swiftinterface`
    pub fn interface(&self, module: &str, content: &str) -> anyhow::Result<PathBuf> {
        let path = self.build_dir().join(format!("{module}.swiftinterface"));
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn settings(&self) -> Settings {
        Settings {
            module_cache_path: Some(self.cache_dir()),
            compiler_name: "langctx-test-compiler".to_string(),
            ..Settings::default()
        }
    }

    /// Target with a single image in the build directory
    pub fn target(&self, id: u64) -> Target {
        self.target_with_images(id, vec![ImageInfo::new(ImageId(1), self.build_dir().join("app"))])
    }

    pub fn target_with_images(&self, id: u64, images: Vec<ImageInfo>) -> Target {
        let mut target = Target::new(TargetId(id), "linux")
            .with_toolchain_root(self.toolchain())
            .with_sdk(self.path().join("sdk"));
        for image in images {
            target = target.with_image(image);
        }
        target
    }

    pub fn registry(&self, frontend: Arc<CountingFrontend>) -> ContextRegistry {
        ContextRegistry::new(self.settings())
            .with_frontend(frontend)
            .with_plugin_registry(Arc::new(PluginServerRegistry::default()))
    }

    /// Every `<module>-*.swiftmodule` in the local cache
    pub fn cached_artifacts(&self, module: &str) -> anyhow::Result<Vec<PathBuf>> {
        let pattern = self.cache_dir().join(format!("{module}-*.swiftmodule"));
        let mut paths = Vec::new();
        for entry in glob::glob(&pattern.to_string_lossy())? {
            paths.push(entry?);
        }
        Ok(paths)
    }
}
