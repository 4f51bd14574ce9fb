// Discovery of the compiler plugin worker used for macro expansion
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{PluginError, Result};

pub const PLUGIN_SERVER_NAME: &str = "swift-plugin-server";

static GLOBAL_REGISTRY: Lazy<Arc<PluginServerRegistry>> =
    Lazy::new(|| Arc::new(PluginServerRegistry::new(PluginServerResolver::default())));

/// Replace the last occurrence of `from` in `haystack`
pub fn replace_last(haystack: &str, from: &str, to: &str) -> Option<String> {
    let index = haystack.rfind(from)?;
    let mut replaced = String::with_capacity(haystack.len() + to.len());
    replaced.push_str(&haystack[..index]);
    replaced.push_str(to);
    replaced.push_str(&haystack[index + from.len()..]);
    Some(replaced)
}

/// One way of deriving a worker path from the compiler path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateRule {
    /// Apply each (from, to) last-occurrence substitution in turn
    ReplaceLast(Vec<(String, String)>),
    /// A file with this name in the compiler's directory
    Sibling(String),
}

impl CandidateRule {
    pub fn replace_last(steps: &[(&str, &str)]) -> Self {
        CandidateRule::ReplaceLast(
            steps
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        )
    }

    pub fn apply(&self, compiler: &Path) -> Option<PathBuf> {
        match self {
            CandidateRule::ReplaceLast(steps) => {
                let mut path = compiler.to_str()?.to_string();
                for (from, to) in steps {
                    path = replace_last(&path, from, to)?;
                }
                Some(PathBuf::from(path))
            }
            CandidateRule::Sibling(name) => compiler.parent().map(|dir| dir.join(name)),
        }
    }
}

/// Ordered candidate rules; the first candidate that exists wins
#[derive(Debug, Clone)]
pub struct PluginServerResolver {
    rules: Vec<CandidateRule>,
}

impl Default for PluginServerResolver {
    fn default() -> Self {
        Self {
            rules: vec![
                CandidateRule::replace_last(&[("clang", PLUGIN_SERVER_NAME)]),
                CandidateRule::replace_last(&[("clang", PLUGIN_SERVER_NAME), ("llvm", "swift")]),
                CandidateRule::replace_last(&[("swiftc", PLUGIN_SERVER_NAME)]),
                CandidateRule::Sibling(PLUGIN_SERVER_NAME.to_string()),
            ],
        }
    }
}

impl PluginServerResolver {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: CandidateRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[CandidateRule] {
        &self.rules
    }

    /// Every candidate in rule order, without duplicates
    pub fn candidates(&self, compiler: &Path) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        for candidate in self.rules.iter().filter_map(|rule| rule.apply(compiler)) {
            if candidate != compiler && !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        candidates
    }

    pub fn resolve(&self, build_dir: &Path, compiler: Option<&Path>) -> Result<PathBuf> {
        let compiler = compiler.ok_or_else(|| PluginError::NoCompiler {
            build_dir: build_dir.to_path_buf(),
        })?;

        let attempted = self.candidates(compiler);
        if let Some(found) = attempted.iter().find(|path| path.is_file()) {
            debug!(build_dir = %build_dir.display(), server = %found.display(), "Plugin server found");
            return Ok(found.clone());
        }

        Err(PluginError::NotFound {
            build_dir: build_dir.to_path_buf(),
            compiler: compiler.to_path_buf(),
            attempted,
        }
        .into())
    }
}

/// Build directory -> plugin worker mapping, at most one worker per directory
#[derive(Debug)]
pub struct PluginServerRegistry {
    resolver: PluginServerResolver,
    servers: RwLock<BTreeMap<PathBuf, PathBuf>>,
}

impl Default for PluginServerRegistry {
    fn default() -> Self {
        Self::new(PluginServerResolver::default())
    }
}

impl PluginServerRegistry {
    pub fn new(resolver: PluginServerResolver) -> Self {
        Self {
            resolver,
            servers: RwLock::new(BTreeMap::new()),
        }
    }

    /// The process-wide registry shared by every context
    pub fn global() -> Arc<PluginServerRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Register a worker; an existing registration for the directory is kept.
    /// Returns the worker now registered.
    pub fn register(&self, build_dir: &Path, server: &Path) -> PathBuf {
        let mut servers = self.servers.write();
        servers
            .entry(build_dir.to_path_buf())
            .or_insert_with(|| {
                info!(build_dir = %build_dir.display(), server = %server.display(), "Registered plugin server");
                server.to_path_buf()
            })
            .clone()
    }

    /// Worker registered for `build_dir` or the nearest registered ancestor
    pub fn lookup(&self, build_dir: &Path) -> Option<PathBuf> {
        let servers = self.servers.read();
        build_dir
            .ancestors()
            .find_map(|dir| servers.get(dir).cloned())
    }

    /// Route to the registered worker, resolving and registering it on first use.
    /// A caller's override wins over any registration and is never shared.
    pub fn resolve(
        &self,
        build_dir: &Path,
        compiler: Option<&Path>,
        overrides: &BTreeMap<PathBuf, PathBuf>,
    ) -> Result<PathBuf> {
        if let Some(server) = overrides.get(build_dir) {
            debug!(build_dir = %build_dir.display(), server = %server.display(), "Using plugin server override");
            return Ok(server.clone());
        }
        if let Some(server) = self.lookup(build_dir) {
            return Ok(server);
        }
        let server = self.resolver.resolve(build_dir, compiler)?;
        Ok(self.register(build_dir, &server))
    }

    pub fn entries(&self) -> BTreeMap<PathBuf, PathBuf> {
        self.servers.read().clone()
    }

    /// `-external-plugin-path <build-dir>#<worker>` for every registration
    pub fn render_options(&self) -> Vec<String> {
        self.render_options_with(&BTreeMap::new())
    }

    /// Like [`render_options`](Self::render_options) with `overrides` layered
    /// over the shared registrations
    pub fn render_options_with(&self, overrides: &BTreeMap<PathBuf, PathBuf>) -> Vec<String> {
        let mut servers = self.entries();
        servers.extend(overrides.iter().map(|(dir, server)| (dir.clone(), server.clone())));
        servers
            .iter()
            .flat_map(|(build_dir, server)| {
                [
                    "-external-plugin-path".to_string(),
                    format!("{}#{}", build_dir.display(), server.display()),
                ]
            })
            .collect()
    }

    pub fn clear(&self) {
        self.servers.write().clear();
    }
}
