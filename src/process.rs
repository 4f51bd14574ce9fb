// Process management for frontend invocations: timeout handling, output capture
// and environment management

use crate::error::{LangCtxError, ProcessError, Result};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use tracing::debug;

/// Process execution configuration
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub inherit_env: bool,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            environment: HashMap::new(),
            timeout: None,
            inherit_env: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    /// Command line for logs and error messages
    pub fn display_command(&self) -> String {
        let mut line = self.command.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// Process execution result
#[derive(Debug)]
pub struct ProcessResult {
    pub exit_status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.code()
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Runs external processes with a timeout
#[derive(Debug, Clone)]
pub struct ProcessManager {
    default_timeout: Duration,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Synchronous execution. Safe to call from inside an async runtime: the
    /// process is then driven from a helper thread with its own runtime.
    pub fn execute(&self, config: ProcessConfig) -> Result<ProcessResult> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return std::thread::scope(|scope| {
                scope
                    .spawn(|| self.block_on(config))
                    .join()
                    .unwrap_or_else(|_| {
                        Err(LangCtxError::from(ProcessError::OutputCaptureFailed {
                            message: "process driver thread panicked".to_string(),
                            command: String::new(),
                        }))
                    })
            });
        }
        self.block_on(config)
    }

    fn block_on(&self, config: ProcessConfig) -> Result<ProcessResult> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(LangCtxError::Io)?
            .block_on(self.execute_async(config))
    }

    pub async fn execute_async(&self, config: ProcessConfig) -> Result<ProcessResult> {
        use std::process::Stdio;
        use tokio::io::AsyncReadExt;
        use tokio::process::Command;
        use tokio::time::timeout;

        let start_time = std::time::Instant::now();
        debug!(command = %config.display_command(), "Spawning process");

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }

        if !config.inherit_env {
            cmd.env_clear();
        }
        for (key, value) in &config.environment {
            cmd.env(key, value);
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            LangCtxError::from(ProcessError::SpawnFailed {
                command: config.command.clone(),
                error: e.to_string(),
            })
        })?;

        let timeout_duration = config.timeout.unwrap_or(self.default_timeout);
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let execution_result = timeout(timeout_duration, async {
            let mut stdout_data = Vec::new();
            let mut stderr_data = Vec::new();

            // Drain both pipes together so a chatty stderr cannot block stdout
            let read_stdout = async {
                match stdout.as_mut() {
                    Some(pipe) => pipe.read_to_end(&mut stdout_data).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let read_stderr = async {
                match stderr.as_mut() {
                    Some(pipe) => pipe.read_to_end(&mut stderr_data).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let (out_result, err_result) = tokio::join!(read_stdout, read_stderr);
            out_result.and(err_result).map_err(|e| {
                LangCtxError::from(ProcessError::OutputCaptureFailed {
                    message: format!("Failed to read process output: {e}"),
                    command: config.command.clone(),
                })
            })?;

            let exit_status = child.wait().await.map_err(|e| {
                LangCtxError::from(ProcessError::ExecutionFailed {
                    command: config.command.clone(),
                    exit_code: None,
                    stderr: format!("Failed to wait for process: {e}"),
                })
            })?;

            Ok::<ProcessResult, LangCtxError>(ProcessResult {
                exit_status,
                stdout: stdout_data,
                stderr: stderr_data,
                duration: start_time.elapsed(),
            })
        })
        .await;

        match execution_result {
            Ok(result) => result,
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;

                Err(ProcessError::Timeout {
                    command: config.command,
                    duration: timeout_duration,
                }
                .into())
            }
        }
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_config_builder() {
        let config = ProcessConfig::new("swiftc")
            .with_args(["-frontend", "-compile-module-from-interface"])
            .with_env("SWIFT_DRIVER", "1")
            .with_timeout(Duration::from_secs(30));

        assert_eq!(config.args.len(), 2);
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            config.display_command(),
            "swiftc -frontend -compile-module-from-interface"
        );
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let manager = ProcessManager::new();
        let error = manager
            .execute(ProcessConfig::new("/nonexistent/langctx-test-binary"))
            .unwrap_err();
        assert!(matches!(
            error,
            LangCtxError::Process(ref inner) if matches!(**inner, ProcessError::SpawnFailed { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_captures_output() {
        let manager = ProcessManager::new();
        let result = manager
            .execute(ProcessConfig::new("sh").with_args(["-c", "echo out; echo err >&2"]))
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout().trim(), "out");
        assert_eq!(result.stderr().trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout() {
        let manager = ProcessManager::with_timeout(Duration::from_millis(100));
        let error = manager
            .execute(ProcessConfig::new("sleep").with_args(["5"]))
            .unwrap_err();
        assert_eq!(error.exit_code(), crate::error::exit_codes::TIMEOUT_ERROR);
    }
}
