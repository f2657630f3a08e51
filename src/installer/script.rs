// Pre-uninstall / post-install hook scripts.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::InstallError;
use crate::installer::{log_output, CommandRunner};

/// Runs a script file and returns its standard output.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, script: &Path) -> Result<String, InstallError>;
}

/// Runs scripts with the platform shell: PowerShell for `.ps1` and
/// `cmd /C` otherwise on Windows, `/bin/sh` elsewhere.
pub struct ShellScriptRunner {
    commands: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl ShellScriptRunner {
    pub fn new(commands: Arc<dyn CommandRunner>, timeout: Option<Duration>) -> Self {
        Self { commands, timeout }
    }

    /// Interpreter and arguments used to run `script`.
    pub fn script_command(script: &Path) -> (PathBuf, Vec<String>) {
        let script_arg = script.display().to_string();
        if cfg!(target_os = "windows") {
            let ext = script
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            match ext.as_str() {
                "ps1" => (
                    PathBuf::from("powershell.exe"),
                    vec![
                        "-NoProfile".to_string(),
                        "-ExecutionPolicy".to_string(),
                        "Bypass".to_string(),
                        "-File".to_string(),
                        script_arg,
                    ],
                ),
                _ => (PathBuf::from("cmd.exe"), vec!["/C".to_string(), script_arg]),
            }
        } else {
            (PathBuf::from("/bin/sh"), vec![script_arg])
        }
    }
}

#[async_trait]
impl ScriptRunner for ShellScriptRunner {
    async fn run(&self, script: &Path) -> Result<String, InstallError> {
        let (program, args) = Self::script_command(script);
        let output = self.commands.run(&program, &args, self.timeout).await?;
        if output.success() {
            return Ok(output.stdout);
        }

        log_output("script", &output);
        let code = output
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(InstallError::InstallerExecution(format!(
            "{} exited with {}",
            script.display(),
            code
        )))
    }
}

// --- Mock implementation for testing ---

#[derive(Default)]
pub struct MockScriptRunner {
    runs: Mutex<Vec<PathBuf>>,
    error: Option<String>,
}

impl MockScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner whose every script fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            runs: Mutex::new(Vec::new()),
            error: Some(message.to_string()),
        }
    }

    pub fn runs(&self) -> Vec<PathBuf> {
        self.runs.lock().map(|runs| runs.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ScriptRunner for MockScriptRunner {
    async fn run(&self, script: &Path) -> Result<String, InstallError> {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(script.to_path_buf());
        }
        match self.error {
            Some(ref message) => Err(InstallError::InstallerExecution(message.clone())),
            None => Ok(format!("ran {}\n", script.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::{MockCommandRunner, SystemCommandRunner};

    #[cfg(unix)]
    #[test]
    fn test_script_command_uses_sh() {
        let (program, args) = ShellScriptRunner::script_command(Path::new("/opt/hooks/post.sh"));
        assert_eq!(program, PathBuf::from("/bin/sh"));
        assert_eq!(args, vec!["/opt/hooks/post.sh"]);
    }

    #[cfg(windows)]
    #[test]
    fn test_script_command_picks_windows_shell() {
        let (program, args) = ShellScriptRunner::script_command(Path::new("C:\\hooks\\post.ps1"));
        assert_eq!(program, PathBuf::from("powershell.exe"));
        assert_eq!(args.last().map(String::as_str), Some("C:\\hooks\\post.ps1"));

        let (program, args) = ShellScriptRunner::script_command(Path::new("C:\\hooks\\pre.bat"));
        assert_eq!(program, PathBuf::from("cmd.exe"));
        assert_eq!(args[0], "/C");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let commands = Arc::new(MockCommandRunner::with_exit_codes(vec![2]));
        let runner = ShellScriptRunner::new(commands.clone(), None);
        let result = runner.run(Path::new("hook.cmd")).await;
        assert!(matches!(result, Err(InstallError::InstallerExecution(_))));
        assert_eq!(commands.call_count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_script_runner_returns_stdout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("hook.sh");
        std::fs::write(&script, "echo stopping service\necho done\n").unwrap();

        let runner = ShellScriptRunner::new(Arc::new(SystemCommandRunner), None);
        let output = runner.run(&script).await.unwrap();
        assert_eq!(output, "stopping service\ndone\n");
    }

    #[tokio::test]
    async fn test_mock_script_runner_records_runs() {
        let runner = MockScriptRunner::new();
        runner.run(Path::new("a.ps1")).await.unwrap();
        runner.run(Path::new("b.ps1")).await.unwrap();
        assert_eq!(
            runner.runs(),
            vec![PathBuf::from("a.ps1"), PathBuf::from("b.ps1")]
        );

        let failing = MockScriptRunner::failing("boom");
        assert!(failing.run(Path::new("c.ps1")).await.is_err());
    }
}
