// Configuration handling for langctx
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigurationError, LangCtxError, Result};

/// Environment variable that overrides the default local module cache location
pub const MODULE_CACHE_ENV: &str = "LANGCTX_MODULE_CACHE";

/// User-visible settings. Each context takes a snapshot of these when it is built.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Settings {
    pub module_cache_path: Option<PathBuf>,
    pub use_secondary_importer: bool,
    /// Build directory -> plugin worker, bypassing candidate resolution
    pub plugin_server_override: BTreeMap<PathBuf, PathBuf>,
    pub compiler_name: String,
    pub interface_extension: String,
    pub binary_module_extension: String,
    pub compile_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            module_cache_path: None,
            use_secondary_importer: true,
            plugin_server_override: BTreeMap::new(),
            compiler_name: "swiftc".to_string(),
            interface_extension: "swiftinterface".to_string(),
            binary_module_extension: "swiftmodule".to_string(),
            compile_timeout_secs: 300,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigurationError::SettingsNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(LangCtxError::Io)?;
        Self::from_yaml_with_context(&content, Some(path))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_context(yaml, None)
    }

    fn from_yaml_with_context(yaml: &str, source: Option<&Path>) -> Result<Self> {
        // An empty document means "all defaults"
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        let settings: Settings = serde_yaml::from_str(yaml).map_err(|e| {
            let mut config_error = *Box::<ConfigurationError>::from(e);
            if let ConfigurationError::InvalidSettings {
                ref mut file_path, ..
            } = config_error
            {
                *file_path = source.map(Path::to_path_buf);
            }
            LangCtxError::Config(Box::new(config_error))
        })?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let non_empty = [
            ("compiler-name", &self.compiler_name),
            ("interface-extension", &self.interface_extension),
            ("binary-module-extension", &self.binary_module_extension),
        ];
        for (field, value) in non_empty {
            if value.trim().is_empty() {
                return Err(invalid(format!("{field} must not be empty")));
            }
            if value.contains(std::path::MAIN_SEPARATOR) || value.starts_with('.') {
                return Err(invalid(format!("{field} has an invalid value '{value}'")));
            }
        }

        if self.interface_extension == self.binary_module_extension {
            return Err(invalid(
                "interface-extension and binary-module-extension must differ".to_string(),
            ));
        }

        if self.compile_timeout_secs == 0 {
            return Err(invalid("compile-timeout-secs must be positive".to_string()));
        }

        for (build_dir, worker) in &self.plugin_server_override {
            if build_dir.as_os_str().is_empty() || worker.as_os_str().is_empty() {
                return Err(invalid(
                    "plugin-server-override entries need a build directory and a worker path"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    /// Directory for locally compiled modules: `module-cache-path`, then
    /// `$LANGCTX_MODULE_CACHE`, then `$XDG_CACHE_HOME/langctx/ModuleCache`,
    /// then the platform cache directory.
    pub fn local_cache_dir(&self) -> Option<PathBuf> {
        if let Some(path) = &self.module_cache_path {
            return Some(path.clone());
        }
        if let Some(path) = non_empty_env(MODULE_CACHE_ENV) {
            return Some(PathBuf::from(path));
        }
        if let Some(xdg) = non_empty_env("XDG_CACHE_HOME") {
            return Some(PathBuf::from(xdg).join("langctx").join("ModuleCache"));
        }
        dirs::cache_dir().map(|dir| dir.join("langctx").join("ModuleCache"))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn invalid(message: String) -> LangCtxError {
    ConfigurationError::InvalidSettings {
        message,
        file_path: None,
        line: None,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.use_secondary_importer);
        assert_eq!(settings.compiler_name, "swiftc");
        assert_eq!(settings.interface_extension, "swiftinterface");
        assert_eq!(settings.binary_module_extension, "swiftmodule");
        assert_eq!(settings.compile_timeout(), Duration::from_secs(300));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_kebab_case_yaml() {
        let yaml = r#"
module-cache-path: /tmp/cache
use-secondary-importer: false
plugin-server-override:
  /build: /opt/tc/usr/bin/swift-plugin-server
compile-timeout-secs: 30
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.module_cache_path, Some(PathBuf::from("/tmp/cache")));
        assert!(!settings.use_secondary_importer);
        assert_eq!(settings.compile_timeout_secs, 30);
        assert_eq!(
            settings.plugin_server_override.get(Path::new("/build")),
            Some(&PathBuf::from("/opt/tc/usr/bin/swift-plugin-server"))
        );
        assert_eq!(settings.local_cache_dir(), Some(PathBuf::from("/tmp/cache")));
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(Settings::from_yaml("  \n").unwrap(), Settings::default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let error = Settings::from_yaml("compiler-name: swiftc\nbogus-key: 1\n").unwrap_err();
        match error {
            LangCtxError::Config(config_err) => match *config_err {
                ConfigurationError::InvalidSettings { message, .. } => {
                    assert!(message.contains("bogus-key"))
                }
                other => panic!("unexpected error: {other:?}"),
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Settings::from_yaml("compile-timeout-secs: 0").is_err());
        assert!(Settings::from_yaml("interface-extension: swiftmodule").is_err());
        assert!(Settings::from_yaml("binary-module-extension: .swiftmodule").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "compiler-name: swift-frontend").unwrap();
        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.compiler_name, "swift-frontend");

        let missing = Settings::from_file(Path::new("/nonexistent/langctx.yaml")).unwrap_err();
        assert!(missing.to_string().contains("Settings file not found"));
    }
}
