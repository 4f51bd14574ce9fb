// CLI interface for langctx using clap
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::error::{exit_codes, LangCtxError, Result};
use crate::options::{MacroPolicy, OptionSanitizer};
use crate::plugin_server::PluginServerResolver;
use crate::registry::ContextRegistry;
use crate::target::{ImageId, Target};

#[derive(Parser)]
#[command(
    name = "langctx",
    about = "Per-target language contexts and module caches for expression evaluation",
    version = crate::VERSION,
    long_about = "langctx resolves the compiler configuration of a debug target, sanitizes the options recorded in its images and maintains the on-disk module cache used when evaluating expressions."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file (YAML)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Control color output (auto, always, never)
    #[arg(long, global = true, value_name = "WHEN")]
    pub color: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve modules to binary artifacts for a target
    Resolve {
        /// Target description (YAML)
        #[arg(short, long, value_name = "FILE")]
        target: PathBuf,

        /// Resolve as seen by this image's compilation
        #[arg(long, value_name = "ID")]
        image: Option<u64>,

        /// Modules to resolve
        #[arg(required = true, num_args = 1..)]
        modules: Vec<String>,
    },

    /// Locate the plugin worker for a build directory
    PluginServer {
        /// Build directory the plugins were built into
        #[arg(long, value_name = "DIR")]
        build_dir: PathBuf,

        /// Compiler the worker is derived from
        #[arg(long, value_name = "PATH")]
        compiler: Option<PathBuf>,
    },

    /// Merge and sanitize the options recorded in a target's images
    Sanitize {
        /// Target description (YAML)
        #[arg(short, long, value_name = "FILE")]
        target: PathBuf,

        /// How macros defined differently by several images are merged
        #[arg(long, value_enum, default_value = "partition")]
        policy: PolicyArg,

        /// Print the merged set as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve modules, then print the health log
    Health {
        /// Target description (YAML)
        #[arg(short, long, value_name = "FILE")]
        target: PathBuf,

        /// Modules to resolve before dumping
        modules: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Partition,
    FirstWins,
}

impl From<PolicyArg> for MacroPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Partition => MacroPolicy::PartitionPerImage,
            PolicyArg::FirstWins => MacroPolicy::FirstWins,
        }
    }
}

impl Cli {
    pub fn run(&self) -> Result<i32> {
        self.init_logging();

        let settings = self.load_settings()?;
        match &self.command {
            Commands::Resolve {
                target,
                image,
                modules,
            } => self.resolve(settings, target, image.map(ImageId), modules),
            Commands::PluginServer {
                build_dir,
                compiler,
            } => {
                let server = match settings.plugin_server_override.get(build_dir) {
                    Some(server) => server.clone(),
                    None => PluginServerResolver::default().resolve(build_dir, compiler.as_deref())?,
                };
                println!("{}", server.display());
                Ok(exit_codes::SUCCESS)
            }
            Commands::Sanitize {
                target,
                policy,
                json,
            } => {
                let target = Target::from_file(target)?;
                let set = OptionSanitizer::new((*policy).into()).sanitize(&target.image_options());
                if *json {
                    let rendered = serde_json::to_string_pretty(&set).map_err(|e| {
                        LangCtxError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                    })?;
                    println!("{rendered}");
                } else {
                    println!("{}", set.render_line());
                    for key in set.suppressed() {
                        println!("suppressed: {key}");
                    }
                    for (image, macros) in set.image_macros() {
                        let rendered: Vec<String> =
                            macros.iter().map(|m| m.directive.to_string()).collect();
                        println!("{image}: {}", rendered.join(" "));
                    }
                }
                Ok(exit_codes::SUCCESS)
            }
            Commands::Health { target, modules } => {
                let registry = ContextRegistry::new(settings);
                let target = Target::from_file(target)?;
                let outcome = registry.get_context(&target).map(|context| {
                    modules
                        .iter()
                        .filter_map(|module| context.resolve_module(module).err())
                        .count()
                });
                println!("{}", registry.health_log().dump());
                match outcome {
                    Ok(0) => Ok(exit_codes::SUCCESS),
                    Ok(_) => Ok(exit_codes::GENERAL_ERROR),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn resolve(
        &self,
        settings: Settings,
        target: &Path,
        image: Option<ImageId>,
        modules: &[String],
    ) -> Result<i32> {
        let registry = ContextRegistry::new(settings);
        let target = Target::from_file(target)?;
        let context = registry.get_context(&target)?;

        let mut exit_code = exit_codes::SUCCESS;
        for module in modules {
            let resolved = match image {
                Some(image) => context.resolve_module_for_image(module, image),
                None => context.resolve_module(module),
            };
            match resolved {
                Ok(path) => println!("{module}\t{}", path.display()),
                Err(e) => {
                    if !self.quiet {
                        eprintln!("{}", e.to_evaluator_error());
                    }
                    exit_code = e.exit_code();
                }
            }
        }
        Ok(exit_code)
    }

    fn load_settings(&self) -> Result<Settings> {
        match &self.settings {
            Some(path) => Settings::from_file(path),
            None => Ok(Settings::default()),
        }
    }

    fn init_logging(&self) {
        use crate::logging::{init_logging, LogConfig};

        let log_config =
            LogConfig::from_cli(self.verbose, self.quiet, self.color.clone(), self.log_json);

        if let Err(e) = init_logging(log_config) {
            eprintln!("Failed to initialize logging: {e}");
        }
    }

    /// Whether error output should be colored
    pub fn use_colors(&self) -> bool {
        crate::logging::LogConfig::from_cli(self.verbose, self.quiet, self.color.clone(), false)
            .should_use_colors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing_version() {
        let cli = Cli::try_parse_from(["langctx", "--version"]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["langctx"]).is_err());
    }

    #[test]
    fn test_cli_resolve_command() {
        let cli = Cli::try_parse_from([
            "langctx", "resolve", "--target", "t.yaml", "--image", "2", "Foundation", "AA",
        ])
        .unwrap();
        match cli.command {
            Commands::Resolve {
                target,
                image,
                modules,
            } => {
                assert_eq!(target, PathBuf::from("t.yaml"));
                assert_eq!(image, Some(2));
                assert_eq!(modules, vec!["Foundation".to_string(), "AA".to_string()]);
            }
            _ => panic!("Expected Resolve command"),
        }
    }

    #[test]
    fn test_cli_sanitize_policy() {
        let cli = Cli::try_parse_from([
            "langctx", "sanitize", "-t", "t.yaml", "--policy", "first-wins", "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Sanitize { policy, json, .. } => {
                assert_eq!(MacroPolicy::from(policy), MacroPolicy::FirstWins);
                assert!(json);
            }
            _ => panic!("Expected Sanitize command"),
        }
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from([
            "langctx",
            "plugin-server",
            "--build-dir",
            "/build",
            "--color",
            "never",
            "--settings",
            "s.yaml",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.color, Some("never".to_string()));
        assert_eq!(cli.settings, Some(PathBuf::from("s.yaml")));
        assert!(!cli.use_colors());
    }
}
