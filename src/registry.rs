// Owner of every language context, one per debug target
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::context::{ContextServices, LanguageContext};
use crate::error::{ContextError, LangCtxError, Result};
use crate::frontend::{Frontend, ProcessFrontend};
use crate::logging::HealthLog;
use crate::plugin_server::PluginServerRegistry;
use crate::reflection::{ImageEvent, NoTypeInfo, TriggerOutcome, TypeInfoProvider};
use crate::target::{Target, TargetId};

/// Construction outcome of one target. A failure keeps only its message;
/// the typed error went to the caller that attempted the construction.
#[derive(Debug, Default)]
struct ContextSlot {
    cell: OnceCell<std::result::Result<Arc<LanguageContext>, String>>,
}

impl ContextSlot {
    fn context(&self) -> Option<Arc<LanguageContext>> {
        match self.cell.get() {
            Some(Ok(context)) => Some(Arc::clone(context)),
            _ => None,
        }
    }
}

pub struct ContextRegistry {
    slots: DashMap<TargetId, Arc<ContextSlot>>,
    settings: RwLock<Settings>,
    services: ContextServices,
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("targets", &self.targets())
            .field("settings", &*self.settings.read())
            .finish()
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl ContextRegistry {
    /// Registry running the real compiler and sharing the process-wide plugin registry
    pub fn new(settings: Settings) -> Self {
        Self {
            slots: DashMap::new(),
            settings: RwLock::new(settings),
            services: ContextServices {
                frontend: Arc::new(ProcessFrontend::default()),
                type_provider: Arc::new(NoTypeInfo),
                plugins: PluginServerRegistry::global(),
                health: Arc::new(HealthLog::new()),
            },
        }
    }

    pub fn with_frontend(mut self, frontend: Arc<dyn Frontend>) -> Self {
        self.services.frontend = frontend;
        self
    }

    pub fn with_type_provider(mut self, provider: Arc<dyn TypeInfoProvider>) -> Self {
        self.services.type_provider = provider;
        self
    }

    pub fn with_plugin_registry(mut self, plugins: Arc<PluginServerRegistry>) -> Self {
        self.services.plugins = plugins;
        self
    }

    pub fn with_health_log(mut self, health: Arc<HealthLog>) -> Self {
        self.services.health = health;
        self
    }

    /// The target's context, built on first use. Concurrent first callers wait
    /// for one construction. A failed construction is reported with its typed
    /// error once; later calls get `ConstructionFailed` until the target is reset.
    pub fn get_context(&self, target: &Target) -> Result<Arc<LanguageContext>> {
        let slot = match self.slots.get(&target.id) {
            Some(slot) => Arc::clone(slot.value()),
            None => {
                if !self.settings.read().use_secondary_importer {
                    return Err(LangCtxError::Disabled);
                }
                Arc::clone(self.slots.entry(target.id).or_default().value())
            }
        };

        let mut first_error = None;
        let outcome = slot.cell.get_or_init(|| {
            let settings = self.settings.read().clone();
            match LanguageContext::build(target, settings, self.services.clone()) {
                Ok(context) => Ok(Arc::new(context)),
                Err(e) => {
                    warn!(target_id = %target.id, error = %e, "Language context construction failed");
                    let reason = e.to_string();
                    first_error = Some(e);
                    Err(reason)
                }
            }
        });

        if let Some(error) = first_error {
            return Err(error);
        }
        match outcome {
            Ok(context) => Ok(Arc::clone(context)),
            Err(reason) => Err(ContextError::ConstructionFailed {
                target: target.id,
                reason: reason.clone(),
            }
            .into()),
        }
    }

    /// Already built context of a target
    pub fn context(&self, target: TargetId) -> Option<Arc<LanguageContext>> {
        self.slots.get(&target).and_then(|slot| slot.context())
    }

    /// Forget a destroyed target. Returns whether it had a slot.
    pub fn remove_target(&self, target: TargetId) -> bool {
        match self.slots.remove(&target) {
            Some((_, slot)) => {
                if let Some(context) = slot.context() {
                    context.tear_down();
                }
                info!(target_id = %target, "Removed language context");
                true
            }
            None => false,
        }
    }

    /// Drop the target's context so the next request rebuilds it with the
    /// current settings
    pub fn reset_target(&self, target: TargetId) -> bool {
        let removed = self.remove_target(target);
        if removed {
            info!(target_id = %target, "Language context reset");
        }
        removed
    }

    /// Replace the settings used for contexts built from now on
    pub fn update_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        *self.settings.write() = settings;
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Route an image event to its target's context. `None` when the target
    /// has no context yet; it picks the image up at construction.
    pub fn handle_image_event(&self, event: &ImageEvent) -> Option<TriggerOutcome> {
        self.context(event.target())
            .map(|context| context.handle_image_event(event))
    }

    pub fn health_log(&self) -> Arc<HealthLog> {
        Arc::clone(&self.services.health)
    }

    pub fn plugin_registry(&self) -> Arc<PluginServerRegistry> {
        Arc::clone(&self.services.plugins)
    }

    pub fn targets(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = self.slots.iter().map(|slot| *slot.key()).collect();
        targets.sort();
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CONFIGURATION_LOG_LABEL;
    use crate::diagnostics::DiagnosticBridge;
    use crate::frontend::{CompileOutput, CompileRequest, ExpansionOutput, MacroExpansionRequest};
    use tempfile::TempDir;

    struct NullFrontend;

    impl Frontend for NullFrontend {
        fn compile_interface(
            &self,
            _request: &CompileRequest,
            _diagnostics: &DiagnosticBridge,
        ) -> Result<CompileOutput> {
            Ok(CompileOutput {
                payload: b"module".to_vec(),
            })
        }

        fn expand_macro(
            &self,
            _request: &MacroExpansionRequest,
            _diagnostics: &DiagnosticBridge,
        ) -> Result<ExpansionOutput> {
            Ok(ExpansionOutput {
                source: String::new(),
            })
        }
    }

    fn registry(root: &TempDir) -> ContextRegistry {
        let settings = Settings {
            module_cache_path: Some(root.path().join("cache")),
            compiler_name: "langctx-no-such-compiler".to_string(),
            ..Settings::default()
        };
        ContextRegistry::new(settings)
            .with_frontend(Arc::new(NullFrontend))
            .with_plugin_registry(Arc::new(PluginServerRegistry::default()))
    }

    fn target(root: &TempDir, id: u64) -> Target {
        let toolchain = root.path().join("toolchain");
        std::fs::create_dir_all(toolchain.join("usr/lib/swift/linux")).unwrap();
        Target::new(TargetId(id), "linux").with_toolchain_root(toolchain)
    }

    #[test]
    fn test_same_context_returned() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root);
        let target = target(&root, 1);

        let first = registry.get_context(&target).unwrap();
        let second = registry.get_context(&target).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.health_log().count_label(CONFIGURATION_LOG_LABEL), 1);
    }

    #[test]
    fn test_failed_construction_reported_once() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root);
        let broken = Target::new(TargetId(7), "linux").with_toolchain_root(root.path().join("missing"));

        let first = registry.get_context(&broken).unwrap_err();
        assert!(matches!(first, LangCtxError::Config(_)));
        let second = registry.get_context(&broken).unwrap_err();
        assert!(matches!(second, LangCtxError::Context(_)));

        assert!(registry.reset_target(TargetId(7)));
        let third = registry.get_context(&broken).unwrap_err();
        assert!(matches!(third, LangCtxError::Config(_)));
    }

    #[test]
    fn test_remove_tears_down() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root);
        let target = target(&root, 2);

        let context = registry.get_context(&target).unwrap();
        assert!(registry.remove_target(TargetId(2)));
        assert!(context.is_torn_down());
        assert!(registry.context(TargetId(2)).is_none());
        assert!(!registry.remove_target(TargetId(2)));
    }

    #[test]
    fn test_disabled_importer() {
        let root = TempDir::new().unwrap();
        let registry = registry(&root);
        let built = target(&root, 3);
        registry.get_context(&built).unwrap();

        let mut settings = registry.settings();
        settings.use_secondary_importer = false;
        registry.update_settings(settings).unwrap();

        // Existing contexts survive until reset
        assert!(registry.get_context(&built).is_ok());
        assert!(matches!(
            registry.get_context(&target(&root, 4)).unwrap_err(),
            LangCtxError::Disabled
        ));
        registry.reset_target(TargetId(3));
        assert!(matches!(
            registry.get_context(&built).unwrap_err(),
            LangCtxError::Disabled
        ));
    }
}
