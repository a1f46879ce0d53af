//! Contract of the component that actually runs commands (locally, over SSH, ...).
//! Backends only build [`ExecCommand`]s and interpret [`ExecutionResult`]s.
mod local;

pub use local::LocalExecutor;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;

use crate::job::JobLog;
use crate::job::id::JobId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Data written to the standard input of the command.
    pub stdin: Option<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Destination of the command output. `None` means that the output is captured into
    /// [`ExecutionResult::result_lines`].
    pub log: Option<JobLog>,
    /// Identifier assigned by the backend, filled in after the command has been executed.
    pub job_id: Option<JobId>,
}

impl ExecCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            env: Default::default(),
            working_dir: None,
            log: None,
            job_id: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args.extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn log(mut self, log: JobLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Human readable form of the command, used for logging.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|arg| arg.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub successful: bool,
    pub exit_code: i32,
    pub result_lines: Vec<String>,
    pub process_id: String,
    /// How long did the execution take.
    pub age: Duration,
}

impl ExecutionResult {
    pub fn success(result_lines: Vec<String>) -> Self {
        Self {
            successful: true,
            exit_code: 0,
            result_lines,
            process_id: String::new(),
            age: Duration::ZERO,
        }
    }

    pub fn failure(exit_code: i32, result_lines: Vec<String>) -> Self {
        Self {
            successful: false,
            exit_code,
            result_lines,
            process_id: String::new(),
            age: Duration::ZERO,
        }
    }

    pub fn output(&self) -> String {
        self.result_lines.join("\n")
    }
}

/// Runs commands on behalf of a job manager.
///
/// Failures (non-zero exit code, unreachable host, ...) are reported through an unsuccessful
/// [`ExecutionResult`], never through a panic.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        command: &ExecCommand,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send>>;
}
