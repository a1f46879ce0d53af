use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::execution::{ExecCommand, ExecutionResult, Executor};
use crate::job::id::JobId;
use crate::job::result::JobResult;
use crate::job::state::JobState;
use crate::job::{JobContext, JobDefinitionBuilder, JobLog, JobRef};

type ResponseFn = dyn Fn(&ExecCommand) -> ExecutionResult + Send + Sync;

/// Executor that records every command and answers it with a user-provided function.
pub struct MockExecutor {
    response_fn: Mutex<Arc<ResponseFn>>,
    commands: Mutex<Vec<ExecCommand>>,
    delay: Option<Duration>,
}

impl MockExecutor {
    pub fn new(
        response_fn: impl Fn(&ExecCommand) -> ExecutionResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            response_fn: Mutex::new(Arc::new(response_fn)),
            commands: Default::default(),
            delay: None,
        })
    }

    /// Every execution waits for the given time before it returns.
    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        let executor = Arc::into_inner(self).expect("executor is already shared");
        Arc::new(Self {
            delay: Some(delay),
            ..executor
        })
    }

    pub fn set_handler(
        &self,
        response_fn: impl Fn(&ExecCommand) -> ExecutionResult + Send + Sync + 'static,
    ) {
        *self.response_fn.lock().unwrap() = Arc::new(response_fn);
    }

    pub fn commands(&self) -> Vec<ExecCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

impl Executor for MockExecutor {
    fn execute(
        &self,
        command: &ExecCommand,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send>> {
        self.commands.lock().unwrap().push(command.clone());
        let response_fn = self.response_fn.lock().unwrap().clone();
        let command = command.clone();
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut result = (*response_fn)(&command);
            if result.process_id.is_empty() {
                result.process_id = "1000".to_string();
            }
            result
        })
    }
}

pub fn script_job(ctx: &JobContext, name: &str, parents: Vec<JobRef>) -> JobRef {
    ctx.create_job(
        JobDefinitionBuilder::default()
            .name(name)
            .script(format!("echo {name}"))
            .parents(parents)
            .log(JobLog::Discard)
            .build()
            .unwrap(),
    )
    .unwrap()
}

/// Marks the job as submitted under the given backend identifier.
pub fn submitted(job: JobRef, id: &str, state: JobState) -> JobRef {
    let id = JobId::backend(id);
    let result = JobResult {
        command: ExecCommand::new("submit"),
        job_id: id.clone(),
        successful: true,
        exit_code: 0,
        result_lines: vec![],
        tool: None,
        parameters: Default::default(),
        parents: vec![],
    };
    job.set_submitted(id, state, result);
    job
}

/// A record of `qstat -f -F json` output, owned by `alice` in queue `short`.
pub fn pbs_job(state: &str) -> serde_json::Value {
    serde_json::json!({
        "Job_Name": "a",
        "Job_Owner": "alice@login1",
        "job_state": state,
        "queue": "short",
        "resources_used": { "cput": "00:01:00" },
    })
}

/// Successful `qstat -f -F json` output with the given `(id, record)` pairs.
pub fn qstat_output<const N: usize>(jobs: [(&str, serde_json::Value); N]) -> ExecutionResult {
    let jobs: serde_json::Map<String, serde_json::Value> = jobs
        .into_iter()
        .map(|(id, job)| (format!("{id}.pbs-server"), job))
        .collect();
    let output = serde_json::json!({ "pbs_version": "2022.1.1", "Jobs": jobs });
    ExecutionResult::success(
        serde_json::to_string_pretty(&output)
            .unwrap()
            .lines()
            .map(|line| line.to_string())
            .collect(),
    )
}
