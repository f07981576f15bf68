// cacti/src/backup/command.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use tokio::process::Command;
use tracing::debug;
use which::which;

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Diagnostic text for error reports.
    pub fn describe(&self) -> String {
        let status = self
            .code
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        format!(
            "{}\nStdout: {}\nStderr: {}",
            status,
            self.stdout.trim_end(),
            self.stderr.trim_end()
        )
    }
}

/// Runs external commands and reports their output.
///
/// An `Err` means the command could not be started at all; a command that ran
/// and exited non-zero is an `Ok` with `success == false`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &Invocation) -> Result<CommandOutput>;
}

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, command: &Invocation) -> Result<CommandOutput> {
        let name = command.program.clone();
        let program = tokio::task::spawn_blocking(move || which(name))
            .await
            .context("PATH lookup task did not complete")?
            .with_context(|| {
                format!(
                    "{} executable not found in PATH. Please ensure it is installed and in your PATH.",
                    command.program
                )
            })?;
        debug!(command = %command, "running external command");

        let output = Command::new(&program)
            .args(&command.args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", program.display()))?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Splits an opaque flag string on whitespace. Quoting is not interpreted.
pub fn split_flags(flags: &str) -> Vec<String> {
    flags.split_whitespace().map(str::to_string).collect()
}
