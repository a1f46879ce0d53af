use std::fs::File;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Instant;

use anyhow::Context;
use bstr::ByteSlice;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::execution::{ExecCommand, ExecutionResult, Executor};
use crate::job::JobLog;

/// Executes commands as child processes of the current process.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for LocalExecutor {
    fn execute(
        &self,
        command: &ExecCommand,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send>> {
        let command = command.clone();
        Box::pin(async move {
            let started = Instant::now();
            log::debug!("Running command `{}`", command.command_line());
            let mut result = match run_command(&command).await {
                Ok(result) => result,
                Err(error) => {
                    log::debug!("Command `{}` failed: {error:?}", command.program);
                    ExecutionResult::failure(-1, vec![format!("{error:#}")])
                }
            };
            result.age = started.elapsed();
            result
        })
    }
}

fn create_log_file(path: &Path) -> anyhow::Result<File> {
    File::create(path).with_context(|| format!("Cannot create log file {}", path.display()))
}

fn configure_output(command: &mut Command, log: Option<&JobLog>) -> anyhow::Result<()> {
    match log {
        None => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        Some(JobLog::Discard) => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        Some(JobLog::Joined(path)) => {
            let file = create_log_file(path)?;
            let stderr = file.try_clone()?;
            command.stdout(file).stderr(stderr);
        }
        Some(JobLog::Separate { stdout, stderr }) => {
            command
                .stdout(create_log_file(stdout)?)
                .stderr(create_log_file(stderr)?);
        }
    }
    Ok(())
}

async fn run_command(exec: &ExecCommand) -> anyhow::Result<ExecutionResult> {
    let mut command = Command::new(&exec.program);
    command.args(&exec.args).envs(&exec.env);
    if let Some(dir) = &exec.working_dir {
        command.current_dir(dir);
    }
    command.stdin(if exec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    configure_output(&mut command, exec.log.as_ref())?;

    let mut child = command
        .spawn()
        .with_context(|| format!("{} start failed", exec.program))?;
    let process_id = child.id().map(|id| id.to_string()).unwrap_or_default();

    if let (Some(input), Some(mut stdin)) = (&exec.stdin, child.stdin.take()) {
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("{} execution failed", exec.program))?;
    log::trace!(
        "Command `{}` output\nStdout\n{}Stderr\n{}",
        exec.program,
        output.stdout.to_str_lossy(),
        output.stderr.to_str_lossy()
    );

    let mut result_lines: Vec<String> = output
        .stdout
        .to_str_lossy()
        .lines()
        .map(|line| line.to_string())
        .collect();
    if !output.status.success() {
        result_lines.extend(
            output
                .stderr
                .to_str_lossy()
                .lines()
                .map(|line| line.to_string()),
        );
    }

    Ok(ExecutionResult {
        successful: output.status.success(),
        exit_code: output.status.code().unwrap_or(-1),
        result_lines,
        process_id,
        age: Default::default(),
    })
}
