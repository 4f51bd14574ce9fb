// Per-target language context: resolved configuration plus the caches built on it
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Settings;
use crate::diagnostics::{DiagnosticBridge, FrontendOperation};
use crate::error::{ConfigurationError, ContextError, Result};
use crate::frontend::{ExpandedSource, Frontend, MacroExpansionRequest, MacroInvocation};
use crate::logging::{utils as log_utils, HealthLog};
use crate::module_cache::{CacheDirectorySet, ModuleCacheManager, ResolveRequest, ResolvedModule};
use crate::options::{OptionSanitizer, SanitizedOptionSet};
use crate::plugin_server::PluginServerRegistry;
use crate::reflection::{
    CacheInvalidationTrigger, DebugInfoState, ImageEvent, ReflectionCache, TriggerOutcome,
    TypeInfo, TypeInfoProvider,
};
use crate::target::{ImageId, Target, TargetId};
use crate::toolchain::{SearchPathReconstructor, Toolchain};

pub const CONFIGURATION_LOG_LABEL: &str = "LanguageContext::log_configuration";

/// Shared services a context is built with
#[derive(Clone)]
pub struct ContextServices {
    pub frontend: Arc<dyn Frontend>,
    pub type_provider: Arc<dyn TypeInfoProvider>,
    pub plugins: Arc<PluginServerRegistry>,
    pub health: Arc<HealthLog>,
}

impl fmt::Debug for ContextServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextServices")
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

/// Compiler configuration and caches of one debug target
pub struct LanguageContext {
    target: TargetId,
    platform: String,
    settings: Settings,
    toolchain: Toolchain,
    compiler: PathBuf,
    runtime_paths: Vec<PathBuf>,
    search_paths: Vec<PathBuf>,
    options: SanitizedOptionSet,
    module_cache: ModuleCacheManager,
    reflection: Arc<ReflectionCache>,
    trigger: CacheInvalidationTrigger,
    services: ContextServices,
    initialized: AtomicBool,
    torn_down: AtomicBool,
}

impl fmt::Debug for LanguageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageContext")
            .field("target", &self.target)
            .field("platform", &self.platform)
            .field("compiler", &self.compiler)
            .field("search_paths", &self.search_paths)
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

impl LanguageContext {
    /// Resolve the target's toolchain, search paths and options and set up its
    /// caches. Any configuration failure aborts construction.
    pub fn build(target: &Target, settings: Settings, services: ContextServices) -> Result<Self> {
        let span = log_utils::context_construction_span(target.id);
        let _enter = span.enter();

        target.validate()?;
        let (toolchain, runtime_paths) = SearchPathReconstructor::new(settings.clone()).resolve(target)?;
        let compiler = toolchain.compiler_path(&settings.compiler_name);

        let options = OptionSanitizer::default().sanitize(&target.image_options());

        // Explicit include paths first, then the images' own directories, then the runtime
        let mut search_paths: Vec<PathBuf> = Vec::new();
        let candidates = options
            .include_paths()
            .iter()
            .cloned()
            .chain(target.images.iter().filter_map(|image| image.directory().map(Path::to_path_buf)))
            .chain(runtime_paths.iter().cloned());
        for path in candidates {
            if !search_paths.contains(&path) {
                search_paths.push(path);
            }
        }

        let local = settings.local_cache_dir().ok_or_else(|| ConfigurationError::CacheDirectoryFailed {
            path: PathBuf::new(),
            error: "no module cache directory could be determined".to_string(),
        })?;
        let prebuilt = toolchain.prebuilt_cache_dir(&target.platform);
        let module_cache = ModuleCacheManager::new(
            target.id,
            CacheDirectorySet::new(local, Some(prebuilt)),
            settings.interface_extension.clone(),
            settings.binary_module_extension.clone(),
            Arc::clone(&services.frontend),
            Arc::clone(&services.health),
        )?;

        let reflection = Arc::new(ReflectionCache::new(Arc::clone(&services.type_provider)));
        for image in &target.images {
            let state = if image.has_debug_info {
                DebugInfoState::HasDebugInfo
            } else {
                DebugInfoState::NoDebugInfo
            };
            reflection.register_image(image.id, state);
        }
        let trigger = CacheInvalidationTrigger::new(Arc::clone(&reflection));

        let context = Self {
            target: target.id,
            platform: target.platform.clone(),
            settings,
            toolchain,
            compiler,
            runtime_paths,
            search_paths,
            options,
            module_cache,
            reflection,
            trigger,
            services,
            initialized: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        };
        context.log_configuration();
        context.initialized.store(true, Ordering::Release);
        info!(target_id = %context.target, "Language context ready");
        Ok(context)
    }

    /// Write the resolved configuration to the health log as a single entry
    pub fn log_configuration(&self) {
        let mut text = String::new();
        let _ = writeln!(text, "(LanguageContext) {} platform {}", self.target, self.platform);
        let _ = writeln!(text, "Toolchain: {}", self.toolchain.root.display());
        let _ = writeln!(text, "Compiler: {}", self.compiler.display());
        let _ = writeln!(text, "Runtime library paths: ({} items)", self.runtime_paths.len());
        for path in &self.runtime_paths {
            let _ = writeln!(text, "  {}", path.display());
        }
        let _ = writeln!(text, "Module search paths: ({} items)", self.search_paths.len());
        for path in &self.search_paths {
            let _ = writeln!(text, "  {}", path.display());
        }
        let _ = writeln!(text, "Options: {}", self.options.render_line());
        if !self.options.suppressed().is_empty() {
            let suppressed: Vec<&str> = self.options.suppressed().iter().map(String::as_str).collect();
            let _ = writeln!(text, "Suppressed options: {}", suppressed.join(" "));
        }
        for (image, macros) in self.options.image_macros() {
            let rendered: Vec<String> = macros.iter().map(|m| m.directive.to_string()).collect();
            let _ = writeln!(text, "Macros of {image}: {}", rendered.join(" "));
        }
        for conflict in self.options.conflicts() {
            let _ = writeln!(text, "Macro conflict: {}", conflict.name);
        }
        let dirs = self.module_cache.directories();
        let _ = writeln!(text, "Module cache path: {}", dirs.local.display());
        if let Some(prebuilt) = &dirs.prebuilt {
            let _ = writeln!(text, "Using prebuilt module cache path: {}", prebuilt.display());
        }
        let plugin_options = self
            .services
            .plugins
            .render_options_with(&self.settings.plugin_server_override);
        if !plugin_options.is_empty() {
            let _ = writeln!(text, "Plugin servers: {}", plugin_options.join(" "));
        }

        self.services
            .health
            .record(CONFIGURATION_LOG_LABEL, text.trim_end().to_string());
    }

    pub fn target_id(&self) -> TargetId {
        self.target
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn compiler(&self) -> &Path {
        &self.compiler
    }

    pub fn runtime_library_paths(&self) -> &[PathBuf] {
        &self.runtime_paths
    }

    /// Module search paths; the first match wins
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn options(&self) -> &SanitizedOptionSet {
        &self.options
    }

    pub fn module_cache(&self) -> &ModuleCacheManager {
        &self.module_cache
    }

    pub fn reflection_cache(&self) -> &Arc<ReflectionCache> {
        &self.reflection
    }

    pub fn health_log(&self) -> &Arc<HealthLog> {
        &self.services.health
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Flag the context dead. Work already running finishes; its result is dropped.
    pub fn tear_down(&self) {
        if !self.torn_down.swap(true, Ordering::AcqRel) {
            info!(target_id = %self.target, "Language context torn down");
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_torn_down() {
            return Err(ContextError::TornDown { target: self.target }.into());
        }
        Ok(())
    }

    /// Binary module for `module`, compiled with the merged options
    pub fn resolve_module(&self, module: &str) -> Result<PathBuf> {
        Ok(self.resolve_module_detailed(module, None)?.path)
    }

    /// Binary module for `module` as seen by one image's compilation
    pub fn resolve_module_for_image(&self, module: &str, image: ImageId) -> Result<PathBuf> {
        Ok(self.resolve_module_detailed(module, Some(image))?.path)
    }

    pub fn resolve_module_detailed(
        &self,
        module: &str,
        image: Option<ImageId>,
    ) -> Result<ResolvedModule> {
        self.ensure_live()?;

        let options = match image {
            Some(image) => self.options.render_for_image(image),
            None => self.options.render(),
        };
        let request = ResolveRequest {
            module,
            search_paths: &self.search_paths,
            options: &options,
            vfs_overlays: self.options.vfs_overlays(),
            compiler: &self.compiler,
            timeout: self.settings.compile_timeout(),
        };
        let resolved = self.module_cache.resolve(&request);

        if self.is_torn_down() {
            debug!(module = %module, "Discarding resolution for torn down context");
            return Err(ContextError::TornDown { target: self.target }.into());
        }
        resolved
    }

    /// Expand a macro through the plugin worker of its build directory
    pub fn expand_macro(&self, invocation: &MacroInvocation) -> Result<ExpandedSource> {
        self.ensure_live()?;

        let plugin_server = self.services.plugins.resolve(
            &invocation.build_dir,
            Some(self.compiler.as_path()),
            &self.settings.plugin_server_override,
        )?;
        let options = match invocation.image {
            Some(image) => self.options.render_for_image(image),
            None => self.options.render(),
        };
        let request = MacroExpansionRequest {
            invocation: invocation.clone(),
            compiler: self.compiler.clone(),
            plugin_server: plugin_server.clone(),
            options,
            timeout: self.settings.compile_timeout(),
        };

        let bridge = DiagnosticBridge::new(FrontendOperation::MacroExpansion {
            macro_name: invocation.macro_name.clone(),
        });
        let output = self.services.frontend.expand_macro(&request, &bridge)?;
        let warnings = bridge.finish()?;

        self.ensure_live()?;
        debug!(macro_name = %invocation.macro_name, server = %plugin_server.display(), "Macro expanded");
        Ok(ExpandedSource {
            macro_name: invocation.macro_name.clone(),
            source: output.source,
            plugin_server,
            warnings,
        })
    }

    pub fn lookup_type(&self, image: ImageId, type_name: &str) -> Option<Arc<TypeInfo>> {
        self.reflection.lookup(image, type_name)
    }

    pub fn handle_image_event(&self, event: &ImageEvent) -> TriggerOutcome {
        self.trigger.handle(event)
    }
}
