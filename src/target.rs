// Debug target descriptions handed to the context registry
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ConfigurationError, LangCtxError, Result};
use crate::options::ImageOptions;

/// Identifier of a debug target. The registry uses it as the key of its context map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub u64);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target#{}", self.0)
    }
}

/// Identifier of a binary image loaded into a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub u64);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image#{}", self.0)
    }
}

/// A binary image loaded into the debugged process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    pub id: ImageId,
    pub path: PathBuf,
    /// Frontend options embedded in the image's build metadata
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub has_debug_info: bool,
}

impl ImageInfo {
    pub fn new(id: ImageId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            options: Vec::new(),
            has_debug_info: true,
        }
    }

    pub fn with_options<S: Into<String>>(mut self, options: impl IntoIterator<Item = S>) -> Self {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_debug_info(mut self, has_debug_info: bool) -> Self {
        self.has_debug_info = has_debug_info;
        self
    }

    /// Directory containing the image; modules shipped next to a library are found here
    pub fn directory(&self) -> Option<&Path> {
        self.path.parent().filter(|dir| !dir.as_os_str().is_empty())
    }
}

/// Everything the subsystem needs to know about a debug target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Target {
    pub id: TargetId,
    /// Platform name used for runtime and prebuilt directories (e.g. "macosx", "linux")
    pub platform: String,
    #[serde(default)]
    pub sdk_path: Option<PathBuf>,
    #[serde(default)]
    pub toolchain_root: Option<PathBuf>,
    #[serde(default)]
    pub compiler_path: Option<PathBuf>,
    /// Runtime search paths serialized into the binary, when the build recorded them
    #[serde(default)]
    pub serialized_search_paths: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub images: Vec<ImageInfo>,
}

impl Target {
    pub fn new(id: TargetId, platform: impl Into<String>) -> Self {
        Self {
            id,
            platform: platform.into(),
            sdk_path: None,
            toolchain_root: None,
            compiler_path: None,
            serialized_search_paths: None,
            images: Vec::new(),
        }
    }

    pub fn with_sdk(mut self, sdk: impl Into<PathBuf>) -> Self {
        self.sdk_path = Some(sdk.into());
        self
    }

    pub fn with_toolchain_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.toolchain_root = Some(root.into());
        self
    }

    pub fn with_compiler(mut self, compiler: impl Into<PathBuf>) -> Self {
        self.compiler_path = Some(compiler.into());
        self
    }

    pub fn with_serialized_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.serialized_search_paths = Some(paths);
        self
    }

    pub fn with_image(mut self, image: ImageInfo) -> Self {
        self.images.push(image);
        self
    }

    pub fn image(&self, id: ImageId) -> Option<&ImageInfo> {
        self.images.iter().find(|image| image.id == id)
    }

    /// Option fragments of every loaded image, in load order
    pub fn image_options(&self) -> Vec<ImageOptions> {
        self.images
            .iter()
            .map(|image| ImageOptions::new(image.id, image.options.clone()))
            .collect()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let target: Target = serde_yaml::from_str(yaml).map_err(|e| {
            LangCtxError::from(ConfigurationError::InvalidTarget {
                message: e.to_string(),
                file_path: None,
            })
        })?;
        target.validate()?;
        Ok(target)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LangCtxError::from(ConfigurationError::InvalidTarget {
                message: format!("cannot read target description: {e}"),
                file_path: Some(path.to_path_buf()),
            })
        })?;
        Self::from_yaml(&content).map_err(|error| match error {
            LangCtxError::Config(config_err) => match *config_err {
                ConfigurationError::InvalidTarget { message, .. } => {
                    LangCtxError::from(ConfigurationError::InvalidTarget {
                        message,
                        file_path: Some(path.to_path_buf()),
                    })
                }
                other => LangCtxError::Config(Box::new(other)),
            },
            other => other,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.platform.trim().is_empty() {
            return Err(ConfigurationError::InvalidTarget {
                message: "platform must not be empty".to_string(),
                file_path: None,
            }
            .into());
        }

        let mut seen = std::collections::HashSet::new();
        for image in &self.images {
            if !seen.insert(image.id) {
                return Err(ConfigurationError::InvalidTarget {
                    message: format!("duplicate {}", image.id),
                    file_path: None,
                }
                .into());
            }
        }
        Ok(())
    }
}
