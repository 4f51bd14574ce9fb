// Toolchain discovery and default runtime search path reconstruction
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::config::Settings;
use crate::error::{ConfigurationError, Result};
use crate::target::{Target, TargetId};

const XCODE_DEFAULT_TOOLCHAIN: &str = "Developer/Toolchains/XcodeDefault.xctoolchain";

/// A located compiler toolchain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub root: PathBuf,
    pub compiler: Option<PathBuf>,
}

impl Toolchain {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compiler: None,
        }
    }

    pub fn with_compiler(mut self, compiler: impl Into<PathBuf>) -> Self {
        self.compiler = Some(compiler.into());
        self
    }

    /// `<root>/usr/lib/swift`
    pub fn resource_dir(&self) -> PathBuf {
        self.root.join("usr").join("lib").join("swift")
    }

    pub fn runtime_dir(&self, platform: &str) -> PathBuf {
        self.resource_dir().join(platform)
    }

    /// Read-only module cache shipped with the toolchain
    pub fn prebuilt_cache_dir(&self, platform: &str) -> PathBuf {
        self.runtime_dir(platform).join("prebuilt-modules")
    }

    /// The compiler to run: the explicit one, or `<root>/usr/bin/<compiler-name>`
    pub fn compiler_path(&self, compiler_name: &str) -> PathBuf {
        self.compiler
            .clone()
            .unwrap_or_else(|| self.root.join("usr").join("bin").join(compiler_name))
    }

    /// Locate the toolchain of a target; first hit wins
    pub fn discover(target: &Target, settings: &Settings) -> Result<Self> {
        let mut attempted = Vec::new();

        if let Some(root) = &target.toolchain_root {
            attempted.push(root.clone());
            if root.is_dir() {
                let toolchain = Toolchain::new(root);
                return Ok(match &target.compiler_path {
                    Some(compiler) => toolchain.with_compiler(compiler),
                    None => toolchain,
                });
            }
        }

        if let Some(compiler) = &target.compiler_path {
            if let Some(root) = root_of_compiler(compiler) {
                attempted.push(root.clone());
                if root.is_dir() {
                    return Ok(Toolchain::new(root).with_compiler(compiler));
                }
            }
        }

        if let Some(sdk) = &target.sdk_path {
            if let Some(root) = toolchain_from_sdk(sdk) {
                attempted.push(root.clone());
                if root.is_dir() {
                    return Ok(Toolchain::new(root));
                }
            }
        }

        if let Ok(compiler) = which::which(&settings.compiler_name) {
            let compiler = compiler.canonicalize().unwrap_or(compiler);
            if let Some(root) = root_of_compiler(&compiler) {
                debug!(compiler = %compiler.display(), "Using toolchain from PATH");
                return Ok(Toolchain::new(root).with_compiler(compiler));
            }
            attempted.push(compiler);
        }

        Err(ConfigurationError::ToolchainNotFound {
            target: target.id,
            attempted,
            suggestion: Some(format!(
                "set toolchain-root in the target description or put '{}' on PATH",
                settings.compiler_name
            )),
        }
        .into())
    }
}

/// `<root>/usr/bin/<exe>` -> `<root>`
fn root_of_compiler(compiler: &Path) -> Option<PathBuf> {
    let bin = compiler.parent()?;
    let usr = bin.parent()?;
    if bin.file_name()? != "bin" || usr.file_name()? != "usr" {
        return None;
    }
    usr.parent().map(Path::to_path_buf)
}

/// SDKs inside an application bundle sit under `<App>/Contents/Developer/...`;
/// the default toolchain of that bundle is derived from the `Contents` directory.
fn toolchain_from_sdk(sdk: &Path) -> Option<PathBuf> {
    let mut contents = PathBuf::new();
    for component in sdk.components() {
        contents.push(component.as_os_str());
        if matches!(component, Component::Normal(name) if name == "Contents") {
            return Some(contents.join(XCODE_DEFAULT_TOOLCHAIN));
        }
    }
    None
}

/// Outcome of default search path reconstruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultSearchPaths {
    Found(Vec<PathBuf>),
    NoDefaultPaths {
        reason: String,
        attempted: Vec<PathBuf>,
    },
}

impl DefaultSearchPaths {
    pub fn into_result(self, target: TargetId) -> Result<Vec<PathBuf>> {
        match self {
            DefaultSearchPaths::Found(paths) => Ok(paths),
            DefaultSearchPaths::NoDefaultPaths { reason, .. } => {
                Err(ConfigurationError::NoDefaultSearchPaths { target, reason }.into())
            }
        }
    }
}

/// Derives runtime library search paths for targets that did not serialize them
#[derive(Debug, Clone)]
pub struct SearchPathReconstructor {
    settings: Settings,
}

impl SearchPathReconstructor {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Ordered, de-duplicated runtime library paths for the target.
    /// Serialized paths are used verbatim; otherwise the toolchain defaults are
    /// `<toolchain>/usr/lib/swift/<platform>` followed by `<sdk>/usr/lib/swift`.
    pub fn reconstruct(&self, target: &Target, toolchain: Option<&Toolchain>) -> DefaultSearchPaths {
        if let Some(serialized) = &target.serialized_search_paths {
            if !serialized.is_empty() {
                return DefaultSearchPaths::Found(dedup(serialized.iter().cloned()));
            }
        }

        let Some(toolchain) = toolchain else {
            return DefaultSearchPaths::NoDefaultPaths {
                reason: "toolchain root could not be located".to_string(),
                attempted: Vec::new(),
            };
        };

        let mut paths = vec![toolchain.runtime_dir(&target.platform)];
        if let Some(sdk) = &target.sdk_path {
            paths.push(sdk.join("usr").join("lib").join("swift"));
        }
        DefaultSearchPaths::Found(dedup(paths))
    }

    /// Discover the toolchain and reconstruct paths in one step
    pub fn resolve(&self, target: &Target) -> Result<(Toolchain, Vec<PathBuf>)> {
        let toolchain = Toolchain::discover(target, &self.settings)?;
        let paths = self.reconstruct(target, Some(&toolchain)).into_result(target.id)?;
        Ok((toolchain, paths))
    }
}

fn dedup(paths: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    paths
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect()
}
