//! External command execution.
//!
//! A [`CommandLine`] carries its own working directory, so switching into a
//! checkout for one git call never leaks into the next call.

use anyhow::{Context, Result};
use log::debug;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::RealRuntime;

const REDACTED: &str = "****";

#[derive(Clone, PartialEq, Eq)]
struct Arg {
    value: String,
    secret: bool,
}

/// A program invocation: program name, arguments and working directory.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<Arg>,
    cwd: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(Arg {
            value: value.into(),
            secret: false,
        });
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for value in values {
            self = self.arg(value);
        }
        self
    }

    /// Add an argument that must never show up in logs or error messages.
    pub fn secret_arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(Arg {
            value: value.into(),
            secret: true,
        });
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_values(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|a| a.value.as_str())
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.secret {
                write!(f, " {}", REDACTED)?;
            } else {
                write!(f, " {}", arg.value)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandLine")
            .field("command", &self.to_string())
            .field("cwd", &self.cwd)
            .finish()
    }
}

/// An external command ran but exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    /// Rendered command line, secrets redacted
    pub command: String,
    /// Exit code, `None` when terminated by a signal
    pub status: Option<i32>,
    /// Captured standard error
    pub stderr: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "`{}` exited with status {}", self.command, code)?,
            None => write!(f, "`{}` was terminated by a signal", self.command)?,
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {}", stderr)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandError {}

impl RealRuntime {
    fn command(cmd: &CommandLine) -> Command {
        let mut command = Command::new(cmd.program());
        command.args(cmd.arg_values());
        if let Some(dir) = cmd.cwd() {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null());
        command
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn run_impl(&self, cmd: &CommandLine) -> Result<()> {
        debug!("Running `{}` in {:?}", cmd, cmd.cwd());
        let output = Self::command(cmd)
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute `{}`", cmd))?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !stderr.is_empty() {
            eprint!("{}", stderr);
        }

        if !output.status.success() {
            return Err(CommandError {
                command: cmd.to_string(),
                status: output.status.code(),
                stderr,
            }
            .into());
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn capture_impl(&self, cmd: &CommandLine) -> Result<String> {
        debug!("Capturing `{}` in {:?}", cmd, cmd.cwd());
        let output = Self::command(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute `{}`", cmd))?;

        if !output.status.success() {
            return Err(CommandError {
                command: cmd.to_string(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
