use std::fmt::Display;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::{ExecutorError, Result};

/// The function process to run, parsed from a shell-style command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Split `line` the way a POSIX shell would, without invoking one.
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = shell_words::split(line)
            .map_err(|e| ExecutorError::InvalidCommand(format!("{line:?}: {e}")))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| ExecutorError::InvalidCommand("empty command".to_string()))?;
        Ok(Self {
            program,
            args: words.collect(),
            env: Vec::new(),
            working_dir: None,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Tokio command with all three standard streams piped.
    pub(crate) fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl Display for ProcessCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        f.write_str(&shell_words::join(words))
    }
}
