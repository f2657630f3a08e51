pub mod script;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::InstallError;
use crate::models::{AgentConfig, ItemOutcome};

use self::script::ScriptRunner;

/// msiexec exit codes that mean success with a pending reboot.
const REBOOT_EXIT_CODES: [i32; 2] = [1641, 3010];

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external programs to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`. A process still running after `timeout`
    /// is killed and `InstallError::Timeout` returned.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, InstallError>;

    /// Locate an executable by name or path.
    fn resolve(&self, program: &Path) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, InstallError> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InstallError::InstallerExecution(format!(
                    "Failed to spawn {}: {}",
                    program.display(),
                    e
                ))
            })?;

        // Dropping the wait future drops the child, which kills it.
        let wait = child.wait_with_output();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                InstallError::Timeout(format!(
                    "{} did not finish within {}s",
                    program.display(),
                    limit.as_secs()
                ))
            })?,
            None => wait.await,
        }
        .map_err(|e| {
            InstallError::InstallerExecution(format!(
                "Failed to wait for {}: {}",
                program.display(),
                e
            ))
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// --- Mock implementation for testing ---

/// One recorded call on a [`MockCommandRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Command runner that records invocations instead of spawning processes.
#[derive(Default)]
pub struct MockCommandRunner {
    calls: Mutex<Vec<RecordedCommand>>,
    /// Exit codes handed out in call order; 0 once exhausted.
    exit_codes: Mutex<VecDeque<i32>>,
    /// Calls whose arguments mention this text fail with the paired code.
    fail_matching: Option<(String, i32)>,
    timeout_matching: Option<String>,
    missing_program: bool,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_codes(codes: Vec<i32>) -> Self {
        Self {
            exit_codes: Mutex::new(codes.into()),
            ..Default::default()
        }
    }

    /// Fail every call whose arguments contain `needle`.
    pub fn failing_for(needle: &str, exit_code: i32) -> Self {
        Self {
            fail_matching: Some((needle.to_string(), exit_code)),
            ..Default::default()
        }
    }

    /// Report a timeout for every call whose arguments contain `needle`.
    pub fn timing_out_for(needle: &str) -> Self {
        Self {
            timeout_matching: Some(needle.to_string()),
            ..Default::default()
        }
    }

    /// Resolve no programs, as if the installer were not installed.
    pub fn without_program() -> Self {
        Self {
            missing_program: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<RecordedCommand> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, InstallError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCommand {
                program: program.to_path_buf(),
                args: args.to_vec(),
            });
        }

        let mentions = |needle: &str| args.iter().any(|a| a.contains(needle));

        if let Some(ref needle) = self.timeout_matching {
            if mentions(needle) {
                return Err(InstallError::Timeout(format!(
                    "{} did not finish",
                    program.display()
                )));
            }
        }

        let mut exit_code = self
            .exit_codes
            .lock()
            .ok()
            .and_then(|mut codes| codes.pop_front())
            .unwrap_or(0);
        if let Some((ref needle, code)) = self.fail_matching {
            if mentions(needle) {
                exit_code = code;
            }
        }

        Ok(CommandOutput {
            exit_code: Some(exit_code),
            stdout: format!("{} {}\n", program.display(), args.join(" ")),
            stderr: String::new(),
        })
    }

    fn resolve(&self, program: &Path) -> Option<PathBuf> {
        if self.missing_program {
            None
        } else {
            Some(program.to_path_buf())
        }
    }
}

/// Log captured process output one line at a time.
pub(crate) fn log_output(label: &str, output: &CommandOutput) {
    for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
        tracing::info!("[{}] {}", label, line);
    }
    for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
        tracing::warn!("[{}] {}", label, line);
    }
}

/// Split an argument string on whitespace; double quotes group words.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    Install,
    Uninstall,
}

impl Action {
    fn flag(self) -> &'static str {
        match self {
            Action::Install => "/i",
            Action::Uninstall => "/x",
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::Uninstall => "uninstall",
        }
    }
}

/// Runs the package installer for batches of downloaded artifacts.
pub struct InstallRunner {
    config: Arc<AgentConfig>,
    commands: Arc<dyn CommandRunner>,
    scripts: Arc<dyn ScriptRunner>,
    // One installer process at a time, across all jobs.
    installer_lock: tokio::sync::Mutex<()>,
}

impl InstallRunner {
    pub fn new(
        config: Arc<AgentConfig>,
        commands: Arc<dyn CommandRunner>,
        scripts: Arc<dyn ScriptRunner>,
    ) -> Self {
        Self {
            config,
            commands,
            scripts,
            installer_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether `path` has one of the configured installer package extensions.
    pub fn is_package(&self, path: &Path) -> bool {
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => ext,
            None => return false,
        };
        self.config
            .package_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    /// Install every package in `paths`, then run the post-install hook.
    /// The hook runs for every batch, whatever the item outcomes.
    pub async fn install(&self, paths: &[PathBuf]) -> Vec<ItemOutcome> {
        let outcomes = self.run_batch(Action::Install, paths).await;
        if let Some(ref script) = self.config.post_install_script {
            self.run_hook("post-install", script).await;
        }
        outcomes
    }

    /// Run the pre-uninstall hook, then uninstall every package in `paths`.
    pub async fn uninstall(&self, paths: &[PathBuf]) -> Vec<ItemOutcome> {
        if let Some(ref script) = self.config.pre_uninstall_script {
            self.run_hook("pre-uninstall", script).await;
        }
        self.run_batch(Action::Uninstall, paths).await
    }

    async fn run_batch(&self, action: Action, paths: &[PathBuf]) -> Vec<ItemOutcome> {
        let packages: Vec<&PathBuf> = paths.iter().filter(|p| self.is_package(p)).collect();
        if packages.is_empty() {
            tracing::debug!("No installer packages to {}", action.verb());
            return Vec::new();
        }

        let installer = match self.commands.resolve(&self.config.installer_path) {
            Some(installer) => installer,
            None => {
                let reason = format!(
                    "installer '{}' not found",
                    self.config.installer_path.display()
                );
                tracing::warn!("Skipping {} of {} package(s): {}", action.verb(), packages.len(), reason);
                return packages
                    .into_iter()
                    .map(|p| ItemOutcome::skipped(p, reason.clone()))
                    .collect();
            }
        };

        let extra_args = match action {
            Action::Install => split_args(&self.config.install_args),
            Action::Uninstall => split_args(&self.config.uninstall_args),
        };
        let timeout = match self.config.installer_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let _guard = self.installer_lock.lock().await;
        let mut outcomes = Vec::with_capacity(packages.len());
        for path in packages {
            let mut args = vec![action.flag().to_string(), path.display().to_string()];
            args.extend(extra_args.iter().cloned());

            tracing::info!("Running {} {}", installer.display(), args.join(" "));
            let outcome = match self.commands.run(&installer, &args, timeout).await {
                Ok(output) => {
                    log_output(action.verb(), &output);
                    match output.exit_code {
                        Some(0) => ItemOutcome::success(path),
                        Some(code) if REBOOT_EXIT_CODES.contains(&code) => {
                            tracing::warn!(
                                "{} of {} succeeded but requires a reboot (exit code {})",
                                action.verb(),
                                path.display(),
                                code
                            );
                            ItemOutcome::success(path)
                        }
                        Some(code) => ItemOutcome::failed(path, format!("exit code {}", code)),
                        None => ItemOutcome::failed(path, "terminated by signal"),
                    }
                }
                Err(e) => ItemOutcome::failed(path, e.to_string()),
            };

            if let crate::models::Outcome::Failed(ref reason) = outcome.outcome {
                tracing::error!("Failed to {} {}: {}", action.verb(), path.display(), reason);
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Run a hook script. Missing files are skipped; failures are logged.
    async fn run_hook(&self, label: &str, script: &Path) {
        if !script.exists() {
            tracing::debug!("{} script {} does not exist, skipping", label, script.display());
            return;
        }
        tracing::info!("Running {} script {}", label, script.display());
        match self.scripts.run(script).await {
            Ok(output) => {
                for line in output.lines().filter(|l| !l.trim().is_empty()) {
                    tracing::info!("[{}] {}", label, line);
                }
            }
            Err(e) => tracing::error!("{} script {} failed: {}", label, script.display(), e),
        }
    }
}
